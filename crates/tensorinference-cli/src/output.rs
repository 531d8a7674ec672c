//! Report types and colored output formatting

use anyhow::{Context, Result};
use colored::*;
use serde::{Serialize, Serializer};
use std::fmt::Write as _;

use crate::cli::OutputFormat;

/// Facts about the loaded problem, shared by every report.
#[derive(Debug, Clone, Serialize)]
pub struct ProblemSummary {
    pub problem: String,
    pub nvars: usize,
    pub nfactors: usize,
    pub evidence: Vec<(usize, usize)>,
    /// Elements in the largest intermediate tensor of the plan
    pub max_intermediate: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "task", rename_all = "lowercase")]
pub enum Outcome {
    Pr {
        #[serde(serialize_with = "serialize_log")]
        log_z: f64,
        /// Absent when Z overflows an f64
        #[serde(skip_serializing_if = "Option::is_none")]
        z: Option<f64>,
    },
    Mar {
        marginals: Vec<Vec<f64>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_abs_error: Option<f64>,
    },
    Map {
        #[serde(serialize_with = "serialize_log")]
        log_probability: f64,
        config: Vec<usize>,
    },
    Mmap {
        query: Vec<usize>,
        #[serde(serialize_with = "serialize_log")]
        log_probability: f64,
        config: Vec<usize>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    #[serde(flatten)]
    pub summary: ProblemSummary,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Report {
    pub fn render(&self, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Json => serde_json::to_string_pretty(self).context("Failed to serialize report"),
            OutputFormat::Text => Ok(self.render_text()),
        }
    }

    fn render_text(&self) -> String {
        let s = &self.summary;
        let mut out = String::new();
        let _ = writeln!(out, "{}", s.problem.cyan().bold());
        let _ = writeln!(
            out,
            "  {} variables, {} factors, {} observed, largest intermediate {}",
            s.nvars.to_string().green(),
            s.nfactors.to_string().green(),
            s.evidence.len().to_string().yellow(),
            s.max_intermediate.to_string().magenta()
        );

        match &self.outcome {
            Outcome::Pr { log_z, z } => {
                let _ = writeln!(out, "{} {:.10}", "log Z:".bold(), log_z);
                match z {
                    Some(z) => {
                        let _ = writeln!(out, "{} {:.6e}", "Z:".bold(), z);
                    }
                    None => {
                        let _ = writeln!(out, "{} {}", "Z:".bold(), "exceeds the f64 range".yellow());
                    }
                }
            }
            Outcome::Mar {
                marginals,
                max_abs_error,
            } => {
                for (var, m) in marginals.iter().enumerate() {
                    let values: Vec<String> = m.iter().map(|p| format!("{:.6}", p)).collect();
                    let _ = writeln!(out, "  {:>4}: {}", var.to_string().blue(), values.join(" "));
                }
                if let Some(err) = max_abs_error {
                    let _ = writeln!(out, "{} {:.3e}", "max abs error vs reference:".bold(), err);
                }
            }
            Outcome::Map {
                log_probability,
                config,
            } => {
                let _ = writeln!(out, "{} {:.10}", "log probability:".bold(), log_probability);
                let _ = writeln!(out, "{} {}", "assignment:".bold(), join(config));
            }
            Outcome::Mmap {
                query,
                log_probability,
                config,
            } => {
                let _ = writeln!(out, "{} {}", "query:".bold(), join(query));
                let _ = writeln!(out, "{} {:.10}", "log probability:".bold(), log_probability);
                let _ = writeln!(out, "{} {}", "assignment:".bold(), join(config));
            }
        }
        out
    }
}

/// JSON has no infinities: a zero-mass result is written as the string "-inf".
fn serialize_log<S: Serializer>(value: &f64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    if value.is_finite() {
        serializer.serialize_f64(*value)
    } else {
        serializer.collect_str(value)
    }
}

fn join(values: &[usize]) -> String {
    values.iter().map(usize::to_string).collect::<Vec<_>>().join(" ")
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

pub fn print_warning(message: &str) {
    eprintln!("{} {}", "!".yellow().bold(), message);
}

pub fn enable_colors(enabled: bool) {
    colored::control::set_override(enabled);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcome: Outcome) -> Report {
        Report {
            summary: ProblemSummary {
                problem: "chain.uai".to_string(),
                nvars: 3,
                nfactors: 2,
                evidence: vec![(0, 1)],
                max_intermediate: 4,
            },
            outcome,
        }
    }

    #[test]
    fn test_json_is_flat() {
        let json = report(Outcome::Map {
            log_probability: 1.5,
            config: vec![1, 0, 1],
        })
        .render(OutputFormat::Json)
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["task"], "map");
        assert_eq!(value["nvars"], 3);
        assert_eq!(value["config"], serde_json::json!([1, 0, 1]));
        assert_eq!(value["evidence"], serde_json::json!([[0, 1]]));
    }

    #[test]
    fn test_mar_omits_missing_error() {
        let json = report(Outcome::Mar {
            marginals: vec![vec![0.5, 0.5]],
            max_abs_error: None,
        })
        .render(OutputFormat::Json)
        .unwrap();
        assert!(!json.contains("max_abs_error"));
    }

    #[test]
    fn test_text_output() {
        enable_colors(false);
        let text = report(Outcome::Pr {
            log_z: 18f64.ln(),
            z: Some(18.0),
        })
        .render(OutputFormat::Text)
        .unwrap();
        assert!(text.contains("chain.uai"));
        assert!(text.contains("log Z: 2.8903717579"));
    }

    #[test]
    fn test_non_finite_values() {
        let huge = report(Outcome::Pr {
            log_z: 2000.0,
            z: None,
        });
        let value: serde_json::Value =
            serde_json::from_str(&huge.render(OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(value["log_z"], 2000.0);
        assert!(value.get("z").is_none());
        enable_colors(false);
        assert!(huge
            .render(OutputFormat::Text)
            .unwrap()
            .contains("Z: exceeds the f64 range"));

        let empty = report(Outcome::Map {
            log_probability: f64::NEG_INFINITY,
            config: vec![0, 0, 0],
        });
        let value: serde_json::Value =
            serde_json::from_str(&empty.render(OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(value["log_probability"], "-inf");
    }
}
