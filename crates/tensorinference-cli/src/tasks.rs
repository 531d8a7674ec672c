//! Loading problems and running the inference tasks

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tensorinference::{
    read_td_file, read_uai_mar_file, uai_problem_from_file, ContractionOptions, ContractionPlanner,
    EliminationPlanner, EliminationStrategy, MMAPModel, TensorNetworkModel, UaiInstance,
};
use tracing::info;

use crate::cli::ProblemArgs;
use crate::config::Config;
use crate::output::{Outcome, ProblemSummary, Report};

/// A loaded instance together with the planner and options to run it with.
pub struct Problem {
    pub name: String,
    pub instance: UaiInstance,
    pub planner: Arc<dyn ContractionPlanner>,
    pub options: ContractionOptions,
}

impl Problem {
    pub fn load(args: &ProblemArgs, config: &Config) -> Result<Self> {
        let instance = uai_problem_from_file(&args.uai, args.evidence.as_deref(), None)
            .with_context(|| format!("Failed to load problem {}", args.uai.display()))?;

        let strategy: EliminationStrategy = args.strategy.map(Into::into).unwrap_or(config.strategy);
        let mut planner = EliminationPlanner::new(strategy);
        if let Some(td) = &args.td {
            let decomposition = read_td_file(td)
                .with_context(|| format!("Failed to read tree decomposition {}", td.display()))?;
            if decomposition.num_vertices != instance.nvars {
                bail!(
                    "tree decomposition covers {} vertices but the model has {} variables",
                    decomposition.num_vertices,
                    instance.nvars
                );
            }
            planner = planner.with_order(decomposition.elimination_order());
        }

        let mut options = config.contraction.clone();
        if args.serial {
            options = options.with_parallel(false);
        }
        if let Some(limit) = args.max_tensor_size {
            options = options.with_max_tensor_size(limit);
        }

        info!(
            problem = %args.uai.display(),
            nvars = instance.nvars,
            nfactors = instance.nclique,
            nevidence = instance.obsvars.len(),
            "loaded problem"
        );
        Ok(Self {
            name: args.uai.display().to_string(),
            instance,
            planner: Arc::new(planner),
            options,
        })
    }

    fn model(&self) -> Result<TensorNetworkModel> {
        TensorNetworkModel::builder_from_instance(&self.instance)
            .with_planner(Arc::clone(&self.planner))
            .with_options(self.options.clone())
            .build()
            .context("Failed to build tensor network")
    }

    fn summary(&self, max_intermediate: u128) -> ProblemSummary {
        ProblemSummary {
            problem: self.name.clone(),
            nvars: self.instance.nvars,
            nfactors: self.instance.nclique,
            evidence: self.instance.evidence().into_iter().collect(),
            max_intermediate: u64::try_from(max_intermediate).unwrap_or(u64::MAX),
        }
    }

    pub fn run_pr(&self) -> Result<Report> {
        let model = self.model()?;
        let z = model.probability_rescaled().context("Contraction failed")?;
        let log_z = z.log_sum();
        Ok(Report {
            summary: self.summary(model.max_intermediate_len()?),
            outcome: Outcome::Pr {
                log_z,
                z: Some(log_z.exp()).filter(|z| z.is_finite()),
            },
        })
    }

    pub fn run_mar(&self, reference: Option<&Path>) -> Result<Report> {
        let model = self.model()?;
        let marginals: Vec<Vec<f64>> = model
            .marginals()
            .context("Contraction failed")?
            .into_iter()
            .map(|m| m.iter().copied().collect())
            .collect();

        let max_abs_error = match reference {
            Some(path) => {
                let expected = read_uai_mar_file(path)
                    .with_context(|| format!("Failed to read reference marginals {}", path.display()))?;
                Some(max_abs_error(&marginals, &expected)?)
            }
            None => None,
        };
        Ok(Report {
            summary: self.summary(model.max_intermediate_len()?),
            outcome: Outcome::Mar {
                marginals,
                max_abs_error,
            },
        })
    }

    pub fn run_map(&self) -> Result<Report> {
        let model = self.model()?;
        let (log_probability, config) = model.most_probable_config().context("Contraction failed")?;
        Ok(Report {
            summary: self.summary(model.max_intermediate_len()?),
            outcome: Outcome::Map {
                log_probability,
                config,
            },
        })
    }

    pub fn run_mmap(&self, query: &[usize]) -> Result<Report> {
        let model = MMAPModel::builder_from_instance(&self.instance, query)
            .with_planner(Arc::clone(&self.planner))
            .with_marginalize_planner(Arc::clone(&self.planner))
            .with_options(self.options.clone())
            .build()
            .context("Failed to build marginal MAP model")?;
        let (log_probability, config) = model.most_probable_config().context("Contraction failed")?;

        Ok(Report {
            summary: self.summary(model.max_intermediate_len()?),
            outcome: Outcome::Mmap {
                query: model.get_vars().to_vec(),
                log_probability,
                config,
            },
        })
    }
}

fn max_abs_error(got: &[Vec<f64>], expected: &[Vec<f64>]) -> Result<f64> {
    if got.len() != expected.len() {
        bail!(
            "reference has {} variables but the model has {}",
            expected.len(),
            got.len()
        );
    }
    let mut worst = 0.0f64;
    for (var, (g, e)) in got.iter().zip(expected).enumerate() {
        if g.len() != e.len() {
            bail!("reference marginal of variable {} has {} entries, expected {}", var, e.len(), g.len());
        }
        for (a, b) in g.iter().zip(e) {
            worst = worst.max((a - b).abs());
        }
    }
    Ok(worst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_abs_error() {
        let got = vec![vec![0.25, 0.75], vec![0.5, 0.5]];
        let expected = vec![vec![0.2, 0.8], vec![0.5, 0.5]];
        let err = max_abs_error(&got, &expected).unwrap();
        assert!((err - 0.05).abs() < 1e-12);
        assert!(max_abs_error(&got, &expected[..1]).is_err());
        assert!(max_abs_error(&got, &[vec![0.2, 0.8], vec![1.0]]).is_err());
    }
}
