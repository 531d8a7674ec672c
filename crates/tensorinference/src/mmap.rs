//! Marginal MAP: maximize over query variables after summing out the rest.
//!
//! Non-query variables are grouped into clusters. Each cluster is a
//! [`TensorNetworkModel`] that sums its variables out of the tensors it owns
//! and leaves a tensor over its interface (the query variables those tensors
//! also touch). The outer network holds one vector per query variable, the
//! factors no cluster owns, and one leaf per cluster output; it is contracted
//! in the real semiring for `probability`/`marginals` and in the tropical
//! semiring for `maximum_logp`/`most_probable_config`.

use rayon::prelude::*;
use scirs2_core::ndarray::{ArrayD, IxDyn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info_span, warn};

use crate::contraction::{ContractionOptions, ContractionTree, SemiringTensor};
use crate::einsum::{infer_size_dict, slice_fixed, EinCode, SizeDict};
use crate::error::{InferenceError, Result};
use crate::factor::Factor;
use crate::model::{
    check_evidence, complete_assignment, decode_leaves, distributions, expand_fixed, leaf_marginals,
    log_lookup, network_tensors, sliced_sizes, TensorNetworkModel,
};
use crate::planner::{ContractionPlanner, EliminationPlanner};
use crate::rescaled::{rescale_array, RescaledArray};
use crate::semiring::{Real, Tropical};
use crate::uai::UaiInstance;

/// Splits the marginalized variables into groups summed out together.
pub trait Clusterer: Send + Sync {
    /// `ixs` are the label lists of every tensor in the network.
    fn cluster(&self, marginalized: &[usize], ixs: &[Vec<usize>]) -> Vec<Vec<usize>>;
}

/// Connected components of the factor hypergraph restricted to the
/// marginalized variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectedClusters;

impl Clusterer for ConnectedClusters {
    fn cluster(&self, marginalized: &[usize], ixs: &[Vec<usize>]) -> Vec<Vec<usize>> {
        let position: HashMap<usize, usize> =
            marginalized.iter().enumerate().map(|(i, &v)| (v, i)).collect();
        let mut parent: Vec<usize> = (0..marginalized.len()).collect();

        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        for ix in ixs {
            let mut members = ix.iter().filter_map(|v| position.get(v).copied());
            if let Some(first) = members.next() {
                for other in members {
                    let a = find(&mut parent, first);
                    let b = find(&mut parent, other);
                    if a != b {
                        parent[a.max(b)] = a.min(b);
                    }
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, &var) in marginalized.iter().enumerate() {
            let root = find(&mut parent, i);
            groups.entry(root).or_default().push(var);
        }
        let mut clusters: Vec<Vec<usize>> = groups
            .into_values()
            .map(|mut g| {
                g.sort_unstable();
                g
            })
            .collect();
        clusters.sort_by_key(|g| g.first().copied());
        clusters
    }
}

/// A marginal-MAP problem compiled into an outer network over the query
/// variables and one inner network per cluster of summed variables.
#[derive(Debug, Clone)]
pub struct MMAPModel {
    vars: Vec<usize>,
    code: EinCode,
    tree: ContractionTree,
    tensors: Vec<Factor>,
    clusters: Vec<TensorNetworkModel>,
    fixedvertices: BTreeMap<usize, usize>,
    size_dict: SizeDict,
    options: ContractionOptions,
}

impl MMAPModel {
    pub fn builder(vars: Vec<usize>, cards: Vec<usize>, factors: Vec<Factor>) -> MMAPModelBuilder {
        MMAPModelBuilder::new(vars, cards, factors)
    }

    /// Builder for `instance` maximizing over `queryvars`. Evidence
    /// variables of the instance join the query set.
    pub fn builder_from_instance(instance: &UaiInstance, queryvars: &[usize]) -> MMAPModelBuilder {
        let evidence = instance.evidence();
        let mut query = queryvars.to_vec();
        for var in evidence.keys() {
            if !query.contains(var) {
                query.push(*var);
            }
        }
        Self::builder(
            (0..instance.nvars).collect(),
            instance.cards.clone(),
            instance.factors.clone(),
        )
        .with_queryvars(query)
        .with_evidence(evidence)
    }

    pub fn from_instance(instance: &UaiInstance, queryvars: &[usize]) -> Result<Self> {
        Self::builder_from_instance(instance, queryvars).build()
    }

    /// Query variables, in the order of `most_probable_config` and `marginals`.
    pub fn get_vars(&self) -> &[usize] {
        &self.vars
    }

    pub fn get_cards(&self) -> Vec<usize> {
        self.vars
            .iter()
            .map(|v| self.size_dict.get(v).copied().unwrap_or(0))
            .collect()
    }

    pub fn clusters(&self) -> &[TensorNetworkModel] {
        &self.clusters
    }

    /// Variables summed out by some cluster.
    pub fn marginalized(&self) -> Vec<usize> {
        let mut vars: Vec<usize> = self
            .clusters
            .iter()
            .flat_map(|c| c.get_vars().iter().filter(|v| !c.openvars().contains(v)).copied())
            .collect();
        vars.sort_unstable();
        vars
    }

    pub fn fixedvertices(&self) -> &BTreeMap<usize, usize> {
        &self.fixedvertices
    }

    /// Outer code: query vectors, unowned factors, then one entry per cluster.
    pub fn code(&self) -> &EinCode {
        &self.code
    }

    pub fn tree(&self) -> &ContractionTree {
        &self.tree
    }

    pub fn openvars(&self) -> &[usize] {
        &self.code.iy
    }

    pub fn options(&self) -> &ContractionOptions {
        &self.options
    }

    /// Element count of the largest intermediate tensor of the outer plan
    /// and every cluster plan.
    pub fn max_intermediate_len(&self) -> Result<u128> {
        let mut largest = self.tree.max_intermediate_len(&self.sliced_sizes())?;
        for cluster in &self.clusters {
            largest = largest.max(cluster.max_intermediate_len()?);
        }
        Ok(largest)
    }

    /// Maximum over the query variables of the log of the summed-out mass,
    /// per output cell.
    pub fn maximum_logp(&self) -> Result<ArrayD<f64>> {
        let _span = info_span!("mmap_maximum_logp", nquery = self.vars.len()).entered();
        let leaves = self.tropical_leaves()?;
        self.tree
            .evaluate::<Tropical, ArrayD<f64>>(&leaves, &self.sliced_sizes(), &self.options)
    }

    /// The best assignment of the query variables and its log mass.
    pub fn most_probable_config(&self) -> Result<(f64, Vec<usize>)> {
        let _span = info_span!("mmap_most_probable_config", nquery = self.vars.len()).entered();
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

    /// Log of the summed-out mass at a query assignment in `get_vars` order.
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

    /// Map form of `log_probability`; evidence variables may be omitted.
    pub fn log_probability_map(&self, config: &HashMap<usize, usize>) -> Result<f64> {
        let full = complete_assignment(&self.vars, &self.fixedvertices, config)?;
        let mut total = log_lookup(&self.tensors, &full)?;
        for (cluster, output) in self.clusters.iter().zip(self.cluster_outputs()?) {
            let index: Vec<usize> = cluster
                .openvars()
                .iter()
                .map(|v| if self.fixedvertices.contains_key(v) { 0 } else { full[v] })
                .collect();
            let logs = output.log_values();
            total += *logs.get(IxDyn(&index)).ok_or_else(|| {
                InferenceError::Domain(format!("assignment {:?} is out of range", config))
            })?;
        }
        Ok(total)
    }

    /// Mass of the model over `openvars` with the marginalized variables
    /// summed out; the partition function when no variable is open.
    pub fn probability_rescaled(&self) -> Result<RescaledArray> {
        let _span = info_span!("mmap_probability", nquery = self.vars.len()).entered();
        let leaves = self.real_leaves()?;
        let out = self
            .tree
            .evaluate::<Real, RescaledArray>(&leaves, &self.sliced_sizes(), &self.options)?;
        if out.is_zero() {
            warn!("probability mass is zero under the given evidence");
        }
        Ok(out)
    }

    pub fn probability(&self) -> Result<ArrayD<f64>> {
        Ok(self.probability_rescaled()?.to_array())
    }

    /// Marginal distribution of each query variable.
    pub fn marginals(&self) -> Result<Vec<ArrayD<f64>>> {
        let _span = info_span!("mmap_marginals", nquery = self.vars.len()).entered();
        let leaves = self.real_leaves()?;
        let per_var = leaf_marginals(
            &self.tree,
            leaves,
            self.vars.len(),
            &self.sliced_sizes(),
            &self.options,
        )?;
        let unnormalized = expand_fixed(per_var, &self.vars, &self.size_dict, &self.fixedvertices);
        Ok(distributions(&unnormalized, &self.vars, &self.fixedvertices))
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

    fn cluster_outputs(&self) -> Result<Vec<RescaledArray>> {
        if self.options.parallel {
            self.clusters.par_iter().map(|c| c.probability_rescaled()).collect()
        } else {
            self.clusters.iter().map(|c| c.probability_rescaled()).collect()
        }
    }

    fn real_leaves(&self) -> Result<Vec<RescaledArray>> {
        let mut leaves: Vec<RescaledArray> = self.sliced_potentials()?.iter().map(rescale_array).collect();
        leaves.extend(self.cluster_outputs()?);
        Ok(leaves)
    }

    fn tropical_leaves(&self) -> Result<Vec<ArrayD<f64>>> {
        let mut leaves: Vec<ArrayD<f64>> = self
            .sliced_potentials()?
            .iter()
            .map(<ArrayD<f64> as SemiringTensor<Tropical>>::from_potentials)
            .collect();
        leaves.extend(self.cluster_outputs()?.iter().map(RescaledArray::log_values));
        Ok(leaves)
    }
}

/// Builder for [`MMAPModel`].
pub struct MMAPModelBuilder {
    vars: Vec<usize>,
    cards: Vec<usize>,
    factors: Vec<Factor>,
    queryvars: Vec<usize>,
    openvars: Vec<usize>,
    evidence: BTreeMap<usize, usize>,
    planner: Arc<dyn ContractionPlanner>,
    marginalize_planner: Arc<dyn ContractionPlanner>,
    clusterer: Arc<dyn Clusterer>,
    options: ContractionOptions,
}

impl MMAPModelBuilder {
    pub fn new(vars: Vec<usize>, cards: Vec<usize>, factors: Vec<Factor>) -> Self {
        Self {
            vars,
            cards,
            factors,
            queryvars: Vec::new(),
            openvars: Vec::new(),
            evidence: BTreeMap::new(),
            planner: Arc::new(EliminationPlanner::default()),
            marginalize_planner: Arc::new(EliminationPlanner::default()),
            clusterer: Arc::new(ConnectedClusters),
            options: ContractionOptions::default(),
        }
    }

    /// Variables to maximize over; every other variable is summed out.
    pub fn with_queryvars(mut self, queryvars: Vec<usize>) -> Self {
        self.queryvars = queryvars;
        self
    }

    /// Query variables kept in the output of `probability`/`maximum_logp`.
    pub fn with_openvars(mut self, openvars: Vec<usize>) -> Self {
        self.openvars = openvars;
        self
    }

    pub fn with_evidence<I>(mut self, evidence: I) -> Self
    where
        I: IntoIterator<Item = (usize, usize)>,
    {
        self.evidence.extend(evidence);
        self
    }

    /// Planner for the outer network over the query variables.
    pub fn with_planner(mut self, planner: Arc<dyn ContractionPlanner>) -> Self {
        self.planner = planner;
        self
    }

    /// Planner for the cluster networks.
    pub fn with_marginalize_planner(mut self, planner: Arc<dyn ContractionPlanner>) -> Self {
        self.marginalize_planner = planner;
        self
    }

    pub fn with_clusterer(mut self, clusterer: Arc<dyn Clusterer>) -> Self {
        self.clusterer = clusterer;
        self
    }

    pub fn with_options(mut self, options: ContractionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<MMAPModel> {
        let nvars = self.vars.len();
        let tensors = network_tensors(&self.vars, &self.cards, self.factors)?;
        let ixs: Vec<Vec<usize>> = tensors.iter().map(|t| t.vars().to_vec()).collect();
        let size_dict = infer_size_dict(&ixs, tensors.iter().map(|t| t.vals().shape()))?;
        check_evidence(&self.evidence, &self.vars, &size_dict)?;

        for (i, q) in self.queryvars.iter().enumerate() {
            if !self.vars.contains(q) {
                return Err(InferenceError::VariableNotFound(*q));
            }
            if self.queryvars[..i].contains(q) {
                return Err(InferenceError::Domain(format!("query variable {} listed twice", q)));
            }
        }
        if let Some(v) = self.openvars.iter().find(|v| !self.queryvars.contains(v)) {
            return Err(InferenceError::Domain(format!(
                "open variable {} is not a query variable",
                v
            )));
        }
        let marginalized: Vec<usize> = self
            .vars
            .iter()
            .copied()
            .filter(|v| !self.queryvars.contains(v))
            .collect();
        if let Some(v) = self.evidence.keys().find(|v| marginalized.contains(v)) {
            return Err(InferenceError::InvalidEvidence(format!(
                "variable {} is summed out and cannot be observed",
                v
            )));
        }

        let groups = self.clusterer.cluster(&marginalized, &ixs);
        let owner = cluster_owner(&groups, &marginalized)?;

        // Factor tensors only; per-variable vectors are rebuilt by each side.
        let mut owned: Vec<Vec<Factor>> = vec![Vec::new(); groups.len()];
        let mut interfaces: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); groups.len()];
        let mut outer: Vec<Factor> = Vec::new();
        for (k, tensor) in tensors.into_iter().enumerate() {
            let touched: BTreeSet<usize> = tensor.vars().iter().filter_map(|v| owner.get(v).copied()).collect();
            match touched.len() {
                0 if k < nvars => {
                    // query vectors are re-added in query order below
                }
                0 => outer.push(tensor),
                1 => {
                    let c = touched.into_iter().next().unwrap_or_default();
                    interfaces[c].extend(tensor.vars().iter().filter(|v| !owner.contains_key(*v)));
                    if k >= nvars {
                        owned[c].push(tensor);
                    }
                }
                _ => {
                    return Err(InferenceError::InvalidCluster(format!(
                        "tensor over {:?} touches {} clusters",
                        tensor.vars(),
                        touched.len()
                    )))
                }
            }
        }

        let mut clusters = Vec::with_capacity(groups.len());
        for ((group, factors), interface) in groups.iter().zip(owned).zip(interfaces) {
            let interface: Vec<usize> = interface.into_iter().collect();
            let cluster_vars: Vec<usize> = group.iter().chain(&interface).copied().collect();
            let cluster_cards: Vec<usize> = cluster_vars.iter().map(|v| size_dict[v]).collect();
            let evidence: Vec<(usize, usize)> = self
                .evidence
                .iter()
                .filter(|(v, _)| interface.contains(v))
                .map(|(&v, &x)| (v, x))
                .collect();
            let model = TensorNetworkModel::builder(cluster_vars, cluster_cards, factors)
                .with_openvars(interface)
                .with_evidence(evidence)
                .with_planner(Arc::clone(&self.marginalize_planner))
                .with_options(self.options.clone())
                .build()?;
            clusters.push(model);
        }

        let mut outer_tensors = Vec::with_capacity(self.queryvars.len() + outer.len());
        for &q in &self.queryvars {
            outer_tensors.push(Factor::new(vec![q], ArrayD::ones(IxDyn(&[size_dict[&q]])))?);
        }
        outer_tensors.extend(outer);

        let mut outer_ixs: Vec<Vec<usize>> = outer_tensors.iter().map(|t| t.vars().to_vec()).collect();
        outer_ixs.extend(clusters.iter().map(|c| c.openvars().to_vec()));
        let code = EinCode::new(outer_ixs, self.openvars);
        let tree = self.planner.plan(&code, &size_dict)?;
        tree.validate(&code)?;

        debug!(
            nquery = self.queryvars.len(),
            nmarginalized = marginalized.len(),
            nclusters = clusters.len(),
            "built marginal MAP model"
        );
        Ok(MMAPModel {
            vars: self.queryvars,
            code,
            tree,
            tensors: outer_tensors,
            clusters,
            fixedvertices: self.evidence,
            size_dict,
            options: self.options,
        })
    }
}

/// Cluster index of every marginalized variable, after checking that the
/// groups partition the marginalized set.
fn cluster_owner(groups: &[Vec<usize>], marginalized: &[usize]) -> Result<HashMap<usize, usize>> {
    let mut owner = HashMap::with_capacity(marginalized.len());
    for (c, group) in groups.iter().enumerate() {
        if group.is_empty() {
            return Err(InferenceError::InvalidCluster(format!("cluster {} is empty", c)));
        }
        for &var in group {
            if !marginalized.contains(&var) {
                return Err(InferenceError::InvalidCluster(format!(
                    "variable {} is not summed out",
                    var
                )));
            }
            if owner.insert(var, c).is_some() {
                return Err(InferenceError::InvalidCluster(format!(
                    "variable {} is in more than one cluster",
                    var
                )));
            }
        }
    }
    if let Some(v) = marginalized.iter().find(|v| !owner.contains_key(*v)) {
        return Err(InferenceError::InvalidCluster(format!(
            "variable {} is in no cluster",
            v
        )));
    }
    Ok(owner)
}
