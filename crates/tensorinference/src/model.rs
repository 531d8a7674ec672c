//! Tensor network model for exact inference.
//!
//! The network has one all-ones vector per variable followed by the factor
//! tables. The per-variable vectors carry no information for the forward
//! pass but give every variable its own leaf, so marginals and optimal
//! assignments can be read off the leaves after a backward pass.

use scirs2_core::ndarray::{ArrayD, IxDyn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info_span, warn};

use crate::backward::{argmax_mask, backward_real, decode_assignment, first_argmax, leaf_masks};
use crate::contraction::{ContractionOptions, ContractionTree, SemiringTensor};
use crate::einsum::{infer_size_dict, slice_fixed, EinCode, SizeDict};
use crate::error::{InferenceError, Result};
use crate::factor::Factor;
use crate::planner::{ContractionPlanner, EliminationPlanner};
use crate::rescaled::{rescale_array, RescaledArray};
use crate::semiring::{Real, Tropical};
use crate::uai::UaiInstance;

/// A factor graph compiled into a tensor network with a contraction plan.
#[derive(Debug, Clone)]
pub struct TensorNetworkModel {
    vars: Vec<usize>,
    code: EinCode,
    tree: ContractionTree,
    tensors: Vec<Factor>,
    fixedvertices: BTreeMap<usize, usize>,
    size_dict: SizeDict,
    options: ContractionOptions,
}

impl TensorNetworkModel {
    /// Assemble a model from an externally decided plan.
    ///
    /// `tensors[k]` must carry the labels `code.ixs[k]`, and the first
    /// `vars.len()` tensors must be the per-variable vectors, tensor `k`
    /// labelled `[vars[k]]`.
    pub fn new(
        vars: Vec<usize>,
        code: EinCode,
        tree: ContractionTree,
        tensors: Vec<Factor>,
        fixedvertices: BTreeMap<usize, usize>,
        options: ContractionOptions,
    ) -> Result<Self> {
        if tensors.len() != code.ixs.len() {
            return Err(InferenceError::InvalidPlan(format!(
                "plan has {} inputs but {} tensors were given",
                code.ixs.len(),
                tensors.len()
            )));
        }
        for (k, (ix, tensor)) in code.ixs.iter().zip(&tensors).enumerate() {
            if tensor.vars() != ix.as_slice() {
                return Err(InferenceError::InvalidPlan(format!(
                    "tensor {} is labelled {:?} but the plan says {:?}",
                    k,
                    tensor.vars(),
                    ix
                )));
            }
        }
        check_unique(&vars)?;
        for (k, &v) in vars.iter().enumerate() {
            if code.ixs.get(k).map(Vec::as_slice) != Some(&[v][..]) {
                return Err(InferenceError::InvalidPlan(format!(
                    "tensor {} must be the vector of variable {}",
                    k, v
                )));
            }
        }
        for &label in code.ixs.iter().flatten().chain(&code.iy) {
            if !vars.contains(&label) {
                return Err(InferenceError::VariableNotFound(label));
            }
        }

        let size_dict = infer_size_dict(&code.ixs, tensors.iter().map(|t| t.vals().shape()))?;
        check_evidence(&fixedvertices, &vars, &size_dict)?;
        tree.validate(&code)?;

        debug!(
            nvars = vars.len(),
            ntensors = tensors.len(),
            nfixed = fixedvertices.len(),
            steps = tree.num_contractions(),
            "built tensor network model"
        );
        Ok(Self {
            vars,
            code,
            tree,
            tensors,
            fixedvertices,
            size_dict,
            options,
        })
    }

    /// Start building a model from variables, cardinalities and factors.
    pub fn builder(vars: Vec<usize>, cards: Vec<usize>, factors: Vec<Factor>) -> TensorNetworkModelBuilder {
        TensorNetworkModelBuilder::new(vars, cards, factors)
    }

    /// Builder preloaded with the variables, factors and evidence of `instance`.
    pub fn builder_from_instance(instance: &UaiInstance) -> TensorNetworkModelBuilder {
        Self::builder(
            (0..instance.nvars).collect(),
            instance.cards.clone(),
            instance.factors.clone(),
        )
        .with_evidence(instance.evidence())
    }

    /// Model of `instance` with its evidence applied and a default plan.
    pub fn from_instance(instance: &UaiInstance) -> Result<Self> {
        Self::builder_from_instance(instance).build()
    }

    /// All variables, in the order used by `marginals`.
    pub fn get_vars(&self) -> &[usize] {
        &self.vars
    }

    /// Cardinalities in the order of `get_vars`.
    pub fn get_cards(&self) -> Vec<usize> {
        self.vars
            .iter()
            .map(|v| self.size_dict.get(v).copied().unwrap_or(0))
            .collect()
    }

    pub fn fixedvertices(&self) -> &BTreeMap<usize, usize> {
        &self.fixedvertices
    }

    pub fn code(&self) -> &EinCode {
        &self.code
    }

    pub fn tree(&self) -> &ContractionTree {
        &self.tree
    }

    pub fn tensors(&self) -> &[Factor] {
        &self.tensors
    }

    /// Variables kept in the output of `probability` and `maximum_logp`.
    pub fn openvars(&self) -> &[usize] {
        &self.code.iy
    }

    pub fn options(&self) -> &ContractionOptions {
        &self.options
    }

    /// Element count of the largest intermediate tensor of the plan.
    pub fn max_intermediate_len(&self) -> Result<u128> {
        self.tree.max_intermediate_len(&self.sliced_sizes())
    }

    /// Partition function (or the joint over `openvars`) as a rescaled array.
    pub fn probability_rescaled(&self) -> Result<RescaledArray> {
        let _span = info_span!("probability", nvars = self.vars.len()).entered();
        let leaves = self.real_leaves()?;
        let out = self
            .tree
            .evaluate::<Real, RescaledArray>(&leaves, &self.sliced_sizes(), &self.options)?;
        if out.is_zero() {
            warn!("probability mass is zero under the given evidence");
        }
        Ok(out)
    }

    /// Partition function (or the joint over `openvars`) as a plain array.
    ///
    /// Not normalized when evidence is present.
    pub fn probability(&self) -> Result<ArrayD<f64>> {
        Ok(self.probability_rescaled()?.to_array())
    }

    /// Unnormalized marginal of every variable; each sums to the total mass.
    pub fn unnormalized_marginals(&self) -> Result<Vec<RescaledArray>> {
        let _span = info_span!("marginals", nvars = self.vars.len()).entered();
        let leaves = self.real_leaves()?;
        let per_var = leaf_marginals(
            &self.tree,
            leaves,
            self.vars.len(),
            &self.sliced_sizes(),
            &self.options,
        )?;
        Ok(expand_fixed(per_var, &self.vars, &self.size_dict, &self.fixedvertices))
    }

    /// Marginal distribution of every variable, in the order of `get_vars`.
    ///
    /// Evidence variables get a point mass at their observed value. With
    /// zero total mass the free variables get all-zero vectors.
    pub fn marginals(&self) -> Result<Vec<ArrayD<f64>>> {
        let unnormalized = self.unnormalized_marginals()?;
        Ok(distributions(&unnormalized, &self.vars, &self.fixedvertices))
    }

    /// Log-probability (unnormalized) of a full assignment in `get_vars` order.
    pub fn log_probability(&self, config: &[usize]) -> Result<f64> {
        if config.len() != self.vars.len() {
            return Err(InferenceError::Domain(format!(
                "expected {} values, got {}",
                self.vars.len(),
                config.len()
            )));
        }
        let map: HashMap<usize, usize> = self.vars.iter().copied().zip(config.iter().copied()).collect();
        self.log_probability_map(&map)
    }

    /// Log-probability of an assignment given per variable.
    ///
    /// Evidence variables may be omitted; if present they must agree with
    /// the evidence.
    pub fn log_probability_map(&self, config: &HashMap<usize, usize>) -> Result<f64> {
        let full = complete_assignment(&self.vars, &self.fixedvertices, config)?;
        log_lookup(&self.tensors, &full)
    }

    /// Maximum log-probability per output cell.
    pub fn maximum_logp(&self) -> Result<ArrayD<f64>> {
        let _span = info_span!("maximum_logp", nvars = self.vars.len()).entered();
        let leaves = self.tropical_leaves()?;
        self.tree
            .evaluate::<Tropical, ArrayD<f64>>(&leaves, &self.sliced_sizes(), &self.options)
    }

    /// The most probable assignment of all variables and its log-probability.
    ///
    /// Ties go to the first maximal output cell in row-major order and then,
    /// node by node, to the first witness in row-major order of the summed
    /// labels. Evidence variables report their observed value.
    pub fn most_probable_config(&self) -> Result<(f64, Vec<usize>)> {
        let _span = info_span!("most_probable_config", nvars = self.vars.len()).entered();
        let leaves = self.tropical_leaves()?;
        let (logp, picks) = decode_leaves(&self.tree, &leaves, &self.sliced_sizes(), &self.options)?;
        let config = self
            .vars
            .iter()
            .zip(&picks)
            .map(|(v, pick)| match self.fixedvertices.get(v) {
                Some(&value) => value,
                None => pick.first().copied().unwrap_or(0),
            })
            .collect();
        Ok((logp, config))
    }

    /// Masks over every (evidence-sliced) leaf marking the entries that take
    /// part in some optimal assignment of the global maximum.
    pub fn leaf_masks(&self) -> Result<Vec<ArrayD<bool>>> {
        let leaves = self.tropical_leaves()?;
        let sizes = self.sliced_sizes();
        let cache = self
            .tree
            .evaluate_cached::<Tropical, ArrayD<f64>>(&leaves, &sizes, &self.options)?;
        let ymask = argmax_mask(cache.root(), self.options.tie_tolerance);
        leaf_masks(
            &cache,
            ymask,
            leaves.len(),
            &sizes,
            self.options.tie_tolerance,
        )
    }

    fn sliced_sizes(&self) -> SizeDict {
        sliced_sizes(&self.size_dict, &self.fixedvertices)
    }

    fn sliced_potentials(&self) -> Result<Vec<ArrayD<f64>>> {
        self.tensors
            .iter()
            .map(|t| slice_fixed(t.vals(), t.vars(), &self.fixedvertices))
            .collect()
    }

    pub(crate) fn real_leaves(&self) -> Result<Vec<RescaledArray>> {
        Ok(self.sliced_potentials()?.iter().map(rescale_array).collect())
    }

    pub(crate) fn tropical_leaves(&self) -> Result<Vec<ArrayD<f64>>> {
        Ok(self
            .sliced_potentials()?
            .iter()
            .map(<ArrayD<f64> as SemiringTensor<Tropical>>::from_potentials)
            .collect())
    }
}

/// Builder for [`TensorNetworkModel`].
pub struct TensorNetworkModelBuilder {
    vars: Vec<usize>,
    cards: Vec<usize>,
    factors: Vec<Factor>,
    openvars: Vec<usize>,
    evidence: BTreeMap<usize, usize>,
    planner: Arc<dyn ContractionPlanner>,
    plan: Option<ContractionTree>,
    options: ContractionOptions,
}

impl TensorNetworkModelBuilder {
    pub fn new(vars: Vec<usize>, cards: Vec<usize>, factors: Vec<Factor>) -> Self {
        Self {
            vars,
            cards,
            factors,
            openvars: Vec::new(),
            evidence: BTreeMap::new(),
            planner: Arc::new(EliminationPlanner::default()),
            plan: None,
            options: ContractionOptions::default(),
        }
    }

    /// Keep these variables in the output instead of summing them.
    pub fn with_openvars(mut self, openvars: Vec<usize>) -> Self {
        self.openvars = openvars;
        self
    }

    /// Fix variables to observed values.
    pub fn with_evidence<I>(mut self, evidence: I) -> Self
    where
        I: IntoIterator<Item = (usize, usize)>,
    {
        self.evidence.extend(evidence);
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn ContractionPlanner>) -> Self {
        self.planner = planner;
        self
    }

    /// Use this tree instead of asking the planner. Leaves index the
    /// per-variable vectors first, then the factors.
    pub fn with_plan(mut self, plan: ContractionTree) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_options(mut self, options: ContractionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<TensorNetworkModel> {
        let tensors = network_tensors(&self.vars, &self.cards, self.factors)?;
        let code = EinCode::new(
            tensors.iter().map(|t| t.vars().to_vec()).collect(),
            self.openvars,
        );
        let tree = match self.plan {
            Some(tree) => tree,
            None => {
                let sizes = infer_size_dict(&code.ixs, tensors.iter().map(|t| t.vals().shape()))?;
                self.planner.plan(&code, &sizes)?
            }
        };
        TensorNetworkModel::new(self.vars, code, tree, tensors, self.evidence, self.options)
    }
}

fn check_unique(vars: &[usize]) -> Result<()> {
    for (i, v) in vars.iter().enumerate() {
        if vars[..i].contains(v) {
            return Err(InferenceError::Domain(format!("variable {} listed twice", v)));
        }
    }
    Ok(())
}

pub(crate) fn check_evidence(
    evidence: &BTreeMap<usize, usize>,
    vars: &[usize],
    size_dict: &SizeDict,
) -> Result<()> {
    for (&var, &value) in evidence {
        if !vars.contains(&var) {
            return Err(InferenceError::InvalidEvidence(format!(
                "variable {} is not in the model",
                var
            )));
        }
        let card = size_dict.get(&var).copied().unwrap_or(0);
        if value >= card {
            return Err(InferenceError::InvalidEvidence(format!(
                "value {} out of range for variable {} with cardinality {}",
                value, var, card
            )));
        }
    }
    Ok(())
}

/// Per-variable all-ones vectors followed by the factors, after checking
/// the factors against the declared cardinalities.
pub(crate) fn network_tensors(
    vars: &[usize],
    cards: &[usize],
    factors: Vec<Factor>,
) -> Result<Vec<Factor>> {
    if vars.len() != cards.len() {
        return Err(InferenceError::DimensionMismatch {
            expected: vec![vars.len()],
            got: vec![cards.len()],
        });
    }
    check_unique(vars)?;
    let card_of: HashMap<usize, usize> = vars.iter().copied().zip(cards.iter().copied()).collect();
    for factor in &factors {
        for (&var, &dim) in factor.vars().iter().zip(factor.vals().shape()) {
            let card = *card_of.get(&var).ok_or(InferenceError::VariableNotFound(var))?;
            if card != dim {
                return Err(InferenceError::CardinalityMismatch {
                    var,
                    expected: card,
                    got: dim,
                });
            }
        }
    }

    let mut tensors = Vec::with_capacity(vars.len() + factors.len());
    for (&var, &card) in vars.iter().zip(cards) {
        tensors.push(Factor::new(vec![var], ArrayD::ones(IxDyn(&[card])))?);
    }
    tensors.extend(factors);
    Ok(tensors)
}

pub(crate) fn sliced_sizes(size_dict: &SizeDict, fixed: &BTreeMap<usize, usize>) -> SizeDict {
    let mut sizes = size_dict.clone();
    for var in fixed.keys() {
        sizes.insert(*var, 1);
    }
    sizes
}

/// Resolve a possibly partial assignment against the evidence.
pub(crate) fn complete_assignment(
    vars: &[usize],
    fixed: &BTreeMap<usize, usize>,
    config: &HashMap<usize, usize>,
) -> Result<HashMap<usize, usize>> {
    if let Some(unknown) = config.keys().find(|k| !vars.contains(k)) {
        return Err(InferenceError::Domain(format!(
            "variable {} is not in the model",
            unknown
        )));
    }
    let mut full = HashMap::with_capacity(vars.len());
    for &var in vars {
        let value = match (config.get(&var), fixed.get(&var)) {
            (Some(&given), Some(&observed)) if given != observed => {
                return Err(InferenceError::Domain(format!(
                    "variable {} is observed as {} but {} was given",
                    var, observed, given
                )))
            }
            (Some(&given), _) => given,
            (None, Some(&observed)) => observed,
            (None, None) => {
                return Err(InferenceError::Domain(format!(
                    "no value given for variable {}",
                    var
                )))
            }
        };
        full.insert(var, value);
    }
    Ok(full)
}

/// Sum of log-potentials of `tensors` at `assignment`.
pub(crate) fn log_lookup(tensors: &[Factor], assignment: &HashMap<usize, usize>) -> Result<f64> {
    let mut total = 0.0;
    for tensor in tensors {
        let p = tensor
            .value_at(|var| assignment.get(&var).copied())
            .map_err(|e| match e {
                InferenceError::VariableNotFound(v) => {
                    InferenceError::Domain(format!("no value given for variable {}", v))
                }
                other => other,
            })?;
        total += if p > 0.0 { p.ln() } else { f64::NEG_INFINITY };
    }
    Ok(total)
}

/// Unnormalized marginals of the first `nvars` leaves: leaf ⊙ adjoint.
pub(crate) fn leaf_marginals(
    tree: &ContractionTree,
    leaves: Vec<RescaledArray>,
    nvars: usize,
    sizes: &SizeDict,
    options: &ContractionOptions,
) -> Result<Vec<RescaledArray>> {
    let cache = tree.evaluate_cached::<Real, RescaledArray>(&leaves, sizes, options)?;
    if cache.root().is_zero() {
        warn!("probability mass is zero under the given evidence");
    }
    let ybar = RescaledArray::ones(cache.root().normalized().raw_dim());
    let adjoints = backward_real(&cache, ybar, leaves.len(), sizes)?;
    leaves
        .iter()
        .zip(&adjoints)
        .take(nvars)
        .map(|(leaf, adj)| leaf.combine(adj))
        .collect()
}

/// Tropical forward pass plus decoding of one optimal assignment.
pub(crate) fn decode_leaves(
    tree: &ContractionTree,
    leaves: &[ArrayD<f64>],
    sizes: &SizeDict,
    options: &ContractionOptions,
) -> Result<(f64, Vec<Vec<usize>>)> {
    let cache = tree.evaluate_cached::<Tropical, ArrayD<f64>>(leaves, sizes, options)?;
    let (logp, root) = first_argmax(cache.root())
        .ok_or_else(|| InferenceError::InvalidPlan("contraction produced an empty tensor".to_string()))?;
    if logp == f64::NEG_INFINITY {
        warn!("every configuration has zero probability");
    }
    let picks = decode_assignment(&cache, root, leaves.len(), sizes, options.tie_tolerance)?;
    Ok((logp, picks))
}

/// Widen marginals computed on evidence-sliced leaves back to the full
/// cardinality, with all mass at the observed value.
pub(crate) fn expand_fixed(
    marginals: Vec<RescaledArray>,
    vars: &[usize],
    size_dict: &SizeDict,
    fixed: &BTreeMap<usize, usize>,
) -> Vec<RescaledArray> {
    marginals
        .into_iter()
        .zip(vars)
        .map(|(m, var)| {
            let Some(&value) = fixed.get(var) else {
                return m;
            };
            let card = size_dict.get(var).copied().unwrap_or(1);
            let mass = m.normalized().iter().next().copied().unwrap_or(0.0);
            let mut body = ArrayD::zeros(IxDyn(&[card]));
            if let Some(cell) = body.get_mut(IxDyn(&[value])) {
                *cell = mass;
            }
            RescaledArray::new(m.log_factor(), body)
        })
        .collect()
}

/// Normalize marginals; observed variables become point masses.
pub(crate) fn distributions(
    marginals: &[RescaledArray],
    vars: &[usize],
    fixed: &BTreeMap<usize, usize>,
) -> Vec<ArrayD<f64>> {
    marginals
        .iter()
        .zip(vars)
        .map(|(m, var)| match fixed.get(var) {
            Some(&value) => {
                let mut one_hot = ArrayD::zeros(m.normalized().raw_dim());
                if let Some(cell) = one_hot.get_mut(IxDyn(&[value])) {
                    *cell = 1.0;
                }
                one_hot
            }
            None => m.normalized_distribution(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contraction::ContractionTree;
    use approx::assert_abs_diff_eq;
    use scirs2_core::ndarray::Array;

    fn factor(vars: Vec<usize>, shape: Vec<usize>, values: Vec<f64>) -> Factor {
        Factor::new(vars, Array::from_shape_vec(shape, values).unwrap().into_dyn()).unwrap()
    }

    /// A - B - C with f(A,B) = [[2,1],[1,2]], f(B,C) = [[1,1],[1,3]].
    fn example() -> TensorNetworkModelBuilder {
        TensorNetworkModel::builder(
            vec![0, 1, 2],
            vec![2, 2, 2],
            vec![
                factor(vec![0, 1], vec![2, 2], vec![2.0, 1.0, 1.0, 2.0]),
                factor(vec![1, 2], vec![2, 2], vec![1.0, 1.0, 1.0, 3.0]),
            ],
        )
    }

    #[test]
    fn test_partition_function() {
        let model = example().build().unwrap();
        let z = model.probability().unwrap();
        assert_eq!(z.ndim(), 0);
        assert_abs_diff_eq!(z[[]], 18.0, epsilon = 1e-10);
        assert_eq!(model.get_vars(), &[0, 1, 2]);
        assert_eq!(model.get_cards(), vec![2, 2, 2]);
    }

    #[test]
    fn test_marginals() {
        let model = example().build().unwrap();
        let marginals = model.marginals().unwrap();
        assert_eq!(marginals.len(), 3);
        assert_abs_diff_eq!(marginals[0][[0]], 8.0 / 18.0, epsilon = 1e-10);
        assert_abs_diff_eq!(marginals[1][[1]], 12.0 / 18.0, epsilon = 1e-10);
        assert_abs_diff_eq!(marginals[2][[1]], 12.0 / 18.0, epsilon = 1e-10);

        for m in model.unnormalized_marginals().unwrap() {
            assert_abs_diff_eq!(m.to_array().sum(), 18.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_most_probable_config() {
        let model = example().build().unwrap();
        let (logp, config) = model.most_probable_config().unwrap();
        assert_abs_diff_eq!(logp, 6.0f64.ln(), epsilon = 1e-12);
        assert_eq!(config, vec![1, 1, 1]);
        assert_abs_diff_eq!(model.maximum_logp().unwrap()[[]], logp, epsilon = 1e-12);
        assert_abs_diff_eq!(model.log_probability(&config).unwrap(), logp, epsilon = 1e-12);
    }

    #[test]
    fn test_tie_goes_to_first_witness() {
        let model = TensorNetworkModel::builder(
            vec![0, 1],
            vec![2, 2],
            vec![factor(vec![0, 1], vec![2, 2], vec![1.0, 3.0, 3.0, 1.0])],
        )
        .build()
        .unwrap();
        let (logp, config) = model.most_probable_config().unwrap();
        assert_abs_diff_eq!(logp, 3.0f64.ln(), epsilon = 1e-12);
        assert!(config == vec![0, 1] || config == vec![1, 0]);
        assert_eq!(model.most_probable_config().unwrap().1, config);
        assert_abs_diff_eq!(model.log_probability(&config).unwrap(), logp, epsilon = 1e-12);

        let masks = model.leaf_masks().unwrap();
        assert!(masks[0].iter().all(|m| *m));
        assert!(masks[2][[0, 1]] && masks[2][[1, 0]]);
    }

    #[test]
    fn test_evidence() {
        let model = example().with_evidence([(1, 0)]).build().unwrap();
        // Σ_a f(a,0) · Σ_c f(0,c) = 3 · 2
        assert_abs_diff_eq!(model.probability().unwrap()[[]], 6.0, epsilon = 1e-10);

        let marginals = model.marginals().unwrap();
        assert_eq!(marginals[1].iter().copied().collect::<Vec<_>>(), vec![1.0, 0.0]);
        assert_abs_diff_eq!(marginals[0][[0]], 2.0 / 3.0, epsilon = 1e-10);

        let (logp, config) = model.most_probable_config().unwrap();
        assert_eq!(config, vec![0, 0, 0]);
        assert_abs_diff_eq!(logp, 2.0f64.ln(), epsilon = 1e-12);

        let partial: HashMap<usize, usize> = [(0, 0), (2, 0)].into_iter().collect();
        assert_abs_diff_eq!(model.log_probability_map(&partial).unwrap(), 2.0f64.ln(), epsilon = 1e-12);
        assert!(matches!(
            model.log_probability(&[0, 1, 0]),
            Err(InferenceError::Domain(_))
        ));
    }

    #[test]
    fn test_openvars() {
        let model = example().with_openvars(vec![0, 2]).build().unwrap();
        let p = model.probability().unwrap();
        assert_eq!(p.shape(), &[2, 2]);
        assert_abs_diff_eq!(p.sum(), 18.0, epsilon = 1e-10);
        assert_abs_diff_eq!(p[[1, 1]], 7.0, epsilon = 1e-10);
        let m = model.maximum_logp().unwrap();
        assert_abs_diff_eq!(m[[1, 1]], 6.0f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_zero_mass_is_not_nan() {
        let model = TensorNetworkModel::builder(
            vec![0, 1],
            vec![2, 2],
            vec![
                factor(vec![0], vec![2], vec![1.0, 0.0]),
                factor(vec![0, 1], vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]),
            ],
        )
        .with_evidence([(0, 1)])
        .build()
        .unwrap();
        assert_eq!(model.probability().unwrap()[[]], 0.0);
        let marginals = model.marginals().unwrap();
        assert!(marginals[1].iter().all(|&x| x == 0.0));
        assert_eq!(marginals[0][[1]], 1.0);
        let (logp, config) = model.most_probable_config().unwrap();
        assert_eq!(logp, f64::NEG_INFINITY);
        assert_eq!(config[0], 1);
    }

    #[test]
    fn test_construction_errors() {
        let bad_card = TensorNetworkModel::builder(
            vec![0, 1],
            vec![2, 3],
            vec![factor(vec![0, 1], vec![2, 2], vec![1.0; 4])],
        )
        .build();
        assert!(matches!(
            bad_card,
            Err(InferenceError::CardinalityMismatch { var: 1, expected: 3, got: 2 })
        ));

        let unknown = TensorNetworkModel::builder(
            vec![0],
            vec![2],
            vec![factor(vec![0, 5], vec![2, 2], vec![1.0; 4])],
        )
        .build();
        assert!(matches!(unknown, Err(InferenceError::VariableNotFound(5))));

        let out_of_range = example().with_evidence([(2, 2)]).build();
        assert!(matches!(out_of_range, Err(InferenceError::InvalidEvidence(_))));

        let model = example().build().unwrap();
        assert!(model.log_probability(&[0, 1]).is_err());
        assert!(model.log_probability(&[0, 1, 2]).is_err());
        let stray: HashMap<usize, usize> = [(0, 0), (1, 0), (2, 0), (9, 0)].into_iter().collect();
        assert!(model.log_probability_map(&stray).is_err());
    }

    #[test]
    fn test_explicit_plan() {
        let tensors = network_tensors(
            &[0, 1],
            &[2, 2],
            vec![factor(vec![0, 1], vec![2, 2], vec![1.0, 2.0, 3.0, 4.0])],
        )
        .unwrap();
        let code = EinCode::new(vec![vec![0], vec![1], vec![0, 1]], vec![]);
        let tree = ContractionTree::node(
            vec![
                ContractionTree::leaf(0),
                ContractionTree::leaf(1),
                ContractionTree::leaf(2),
            ],
            EinCode::new(vec![vec![0], vec![1], vec![0, 1]], vec![]),
        );
        let model = TensorNetworkModel::new(
            vec![0, 1],
            code.clone(),
            tree,
            tensors.clone(),
            BTreeMap::new(),
            ContractionOptions::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(model.probability().unwrap()[[]], 10.0, epsilon = 1e-12);

        let broken = ContractionTree::node(
            vec![ContractionTree::leaf(0), ContractionTree::leaf(2)],
            EinCode::new(vec![vec![0], vec![0, 1]], vec![]),
        );
        assert!(TensorNetworkModel::new(
            vec![0, 1],
            code,
            broken,
            tensors,
            BTreeMap::new(),
            ContractionOptions::default()
        )
        .is_err());
    }

    #[test]
    fn test_resource_limit() {
        let model = example()
            .with_openvars(vec![0, 1, 2])
            .with_options(ContractionOptions::default().with_max_tensor_size(4))
            .build()
            .unwrap();
        assert!(matches!(
            model.probability(),
            Err(InferenceError::ResourceExhausted { requested: 8, limit: 4 })
        ));
        assert_eq!(model.max_intermediate_len().unwrap(), 8);
    }
}
