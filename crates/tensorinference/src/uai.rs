//! Problem instances and readers for the UAI text formats.
//!
//! - `.uai`: network type, variable cardinalities, factor scopes and tables.
//!   Tables are row-major with the last scope variable varying fastest.
//! - `.uai.evid`: the last non-empty line holds `n v₁ x₁ … vₙ xₙ`.
//! - `.uai.MAR`: `MAR`, the number of variables, then per variable its
//!   cardinality followed by that many probabilities.
//! - `.td` (PACE 2017): `s td nbags maxbag nverts`, one `b id v…` line per
//!   bag, then tree edges. Bags and vertices are 1-based in the file and
//!   0-based here.
//!
//! All variable indices in this crate are 0-based.

use scirs2_core::ndarray::{ArrayD, IxDyn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{InferenceError, Result};
use crate::factor::Factor;

/// A discrete graphical model with optional evidence and reference marginals.
#[derive(Debug, Clone, PartialEq)]
pub struct UaiInstance {
    pub nvars: usize,
    pub nclique: usize,
    pub cards: Vec<usize>,
    pub factors: Vec<Factor>,
    pub obsvars: Vec<usize>,
    pub obsvals: Vec<usize>,
    pub reference_marginals: Option<Vec<Vec<f64>>>,
}

impl UaiInstance {
    /// Create an instance without evidence, checking factors against `cards`.
    pub fn new(cards: Vec<usize>, factors: Vec<Factor>) -> Result<Self> {
        for factor in &factors {
            for (&var, &dim) in factor.vars().iter().zip(factor.vals().shape()) {
                let card = *cards.get(var).ok_or(InferenceError::VariableNotFound(var))?;
                if card != dim {
                    return Err(InferenceError::CardinalityMismatch {
                        var,
                        expected: card,
                        got: dim,
                    });
                }
            }
        }
        Ok(Self {
            nvars: cards.len(),
            nclique: factors.len(),
            cards,
            factors,
            obsvars: Vec::new(),
            obsvals: Vec::new(),
            reference_marginals: None,
        })
    }

    /// Evidence as a variable -> value map.
    pub fn evidence(&self) -> BTreeMap<usize, usize> {
        self.obsvars
            .iter()
            .copied()
            .zip(self.obsvals.iter().copied())
            .collect()
    }

    /// Replace the evidence, returning the updated instance.
    pub fn set_evidence<I>(mut self, evidence: I) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, usize)>,
    {
        let evidence: BTreeMap<usize, usize> = evidence.into_iter().collect();
        for (&var, &value) in &evidence {
            let card = *self.cards.get(var).ok_or_else(|| {
                InferenceError::InvalidEvidence(format!(
                    "variable {} does not exist in a model with {} variables",
                    var, self.nvars
                ))
            })?;
            if value >= card {
                return Err(InferenceError::InvalidEvidence(format!(
                    "value {} out of range for variable {} with cardinality {}",
                    value, var, card
                )));
            }
        }
        self.obsvars = evidence.keys().copied().collect();
        self.obsvals = evidence.values().copied().collect();
        Ok(self)
    }

    /// Attach reference marginals, checking their shape.
    pub fn with_reference_marginals(mut self, marginals: Vec<Vec<f64>>) -> Result<Self> {
        let got: Vec<usize> = marginals.iter().map(Vec::len).collect();
        if got != self.cards {
            return Err(InferenceError::DimensionMismatch {
                expected: self.cards.clone(),
                got,
            });
        }
        self.reference_marginals = Some(marginals);
        Ok(self)
    }
}

/// Whitespace tokenizer that reports the offending item on failure.
struct Tokens<'a> {
    inner: std::str::SplitWhitespace<'a>,
    source: &'a str,
}

impl<'a> Tokens<'a> {
    fn new(text: &'a str, source: &'a str) -> Self {
        Self {
            inner: text.split_whitespace(),
            source,
        }
    }

    fn next_token(&mut self, what: &str) -> Result<&'a str> {
        self.inner
            .next()
            .ok_or_else(|| InferenceError::parse(self.source, format!("unexpected end of input, expected {}", what)))
    }

    fn next_usize(&mut self, what: &str) -> Result<usize> {
        let tok = self.next_token(what)?;
        tok.parse()
            .map_err(|_| InferenceError::parse(self.source, format!("expected {}, found {:?}", what, tok)))
    }

    fn next_f64(&mut self, what: &str) -> Result<f64> {
        let tok = self.next_token(what)?;
        tok.parse()
            .map_err(|_| InferenceError::parse(self.source, format!("expected {}, found {:?}", what, tok)))
    }
}

/// Parse the text of a `.uai` model.
pub fn parse_uai(text: &str, source: &str) -> Result<UaiInstance> {
    let mut tokens = Tokens::new(text, source);
    let kind = tokens.next_token("network type")?;
    if !kind.eq_ignore_ascii_case("MARKOV") && !kind.eq_ignore_ascii_case("BAYES") {
        return Err(InferenceError::parse(
            source,
            format!("unknown network type {:?}", kind),
        ));
    }

    let nvars = tokens.next_usize("number of variables")?;
    let cards = (0..nvars)
        .map(|_| tokens.next_usize("cardinality"))
        .collect::<Result<Vec<_>>>()?;

    let nclique = tokens.next_usize("number of factors")?;
    let mut scopes = Vec::with_capacity(nclique);
    for _ in 0..nclique {
        let arity = tokens.next_usize("scope size")?;
        let scope = (0..arity)
            .map(|_| tokens.next_usize("scope variable"))
            .collect::<Result<Vec<_>>>()?;
        if let Some(&bad) = scope.iter().find(|&&v| v >= nvars) {
            return Err(InferenceError::parse(
                source,
                format!("scope variable {} out of range for {} variables", bad, nvars),
            ));
        }
        scopes.push(scope);
    }

    let mut factors = Vec::with_capacity(nclique);
    for scope in scopes {
        let expected: usize = scope.iter().map(|&v| cards[v]).product();
        let nentries = tokens.next_usize("table size")?;
        if nentries != expected {
            return Err(InferenceError::parse(
                source,
                format!(
                    "table for scope {:?} has {} entries, expected {}",
                    scope, nentries, expected
                ),
            ));
        }
        let values = (0..nentries)
            .map(|_| tokens.next_f64("table entry"))
            .collect::<Result<Vec<_>>>()?;
        let shape: Vec<usize> = scope.iter().map(|&v| cards[v]).collect();
        let vals = ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| InferenceError::parse(source, e.to_string()))?;
        factors.push(Factor::new(scope, vals)?);
    }

    debug!(source, nvars, nclique, "parsed UAI model");
    UaiInstance::new(cards, factors)
}

/// Parse the text of a `.uai.evid` file into (variable, value) pairs.
pub fn parse_uai_evid(text: &str, source: &str) -> Result<Vec<(usize, usize)>> {
    let Some(line) = text.lines().rev().find(|l| !l.trim().is_empty()) else {
        return Ok(Vec::new());
    };
    let mut tokens = Tokens::new(line, source);
    let nobs = tokens.next_usize("number of observed variables")?;
    let pairs = (0..nobs)
        .map(|_| -> Result<(usize, usize)> {
            Ok((tokens.next_usize("variable")?, tokens.next_usize("value")?))
        })
        .collect::<Result<Vec<_>>>()?;
    if tokens.inner.next().is_some() {
        return Err(InferenceError::parse(
            source,
            format!("more tokens than the {} declared observations", nobs),
        ));
    }
    Ok(pairs)
}

/// Parse the text of a `.uai.MAR` file into one distribution per variable.
pub fn parse_uai_mar(text: &str, source: &str) -> Result<Vec<Vec<f64>>> {
    let mut tokens = Tokens::new(text, source);
    let header = tokens.next_token("MAR header")?;
    if header != "MAR" {
        return Err(InferenceError::parse(
            source,
            format!("expected MAR header, found {:?}", header),
        ));
    }
    let nvars = tokens.next_usize("number of variables")?;
    (0..nvars)
        .map(|_| -> Result<Vec<f64>> {
            let card = tokens.next_usize("cardinality")?;
            (0..card).map(|_| tokens.next_f64("probability")).collect()
        })
        .collect()
}

/// A tree decomposition in PACE format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDecomposition {
    pub num_bags: usize,
    pub max_bag_size: usize,
    pub num_vertices: usize,
    /// Vertices of every bag, 0-based
    pub bags: Vec<Vec<usize>>,
    /// Tree edges between bags, 0-based
    pub edges: Vec<(usize, usize)>,
}

impl TreeDecomposition {
    /// Elimination order induced by the decomposition.
    ///
    /// Bags are visited leaves-first from bag 0; a vertex is eliminated at
    /// the bag where it no longer appears in the parent. Vertices in no bag
    /// come last.
    pub fn elimination_order(&self) -> Vec<usize> {
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); self.bags.len()];
        for &(a, b) in &self.edges {
            if a < adjacency.len() && b < adjacency.len() {
                adjacency[a].push(b);
                adjacency[b].push(a);
            }
        }

        let mut order = Vec::with_capacity(self.num_vertices);
        let mut eliminated = vec![false; self.num_vertices];
        let mut visited = vec![false; self.bags.len()];
        for root in 0..self.bags.len() {
            if visited[root] {
                continue;
            }
            // iterative DFS recording (bag, parent) in preorder
            let mut preorder: Vec<(usize, Option<usize>)> = Vec::new();
            let mut stack = vec![(root, None)];
            visited[root] = true;
            while let Some((bag, parent)) = stack.pop() {
                preorder.push((bag, parent));
                for &next in &adjacency[bag] {
                    if !visited[next] {
                        visited[next] = true;
                        stack.push((next, Some(bag)));
                    }
                }
            }
            for &(bag, parent) in preorder.iter().rev() {
                let keep: &[usize] = parent.map(|p| self.bags[p].as_slice()).unwrap_or(&[]);
                for &v in &self.bags[bag] {
                    if v < eliminated.len() && !eliminated[v] && !keep.contains(&v) {
                        eliminated[v] = true;
                        order.push(v);
                    }
                }
            }
        }
        for (v, done) in eliminated.iter().enumerate() {
            if !done {
                order.push(v);
            }
        }
        order
    }
}

/// Parse the text of a PACE `.td` file.
pub fn parse_td(text: &str, source: &str) -> Result<TreeDecomposition> {
    let mut header: Option<(usize, usize, usize)> = None;
    let mut bags: Vec<Option<Vec<usize>>> = Vec::new();
    let mut edges = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('c') {
            continue;
        }
        let mut tokens = Tokens::new(line, source);
        if line.starts_with('s') {
            tokens.next_token("s")?;
            let kind = tokens.next_token("td")?;
            if kind != "td" {
                return Err(InferenceError::parse(source, format!("expected 'td', found {:?}", kind)));
            }
            let nbags = tokens.next_usize("number of bags")?;
            let maxbag = tokens.next_usize("largest bag size")?;
            let nverts = tokens.next_usize("number of vertices")?;
            bags = vec![None; nbags];
            header = Some((nbags, maxbag, nverts));
        } else if line.starts_with('b') {
            let (nbags, _, nverts) = header
                .ok_or_else(|| InferenceError::parse(source, "bag before the 's td' line"))?;
            tokens.next_token("b")?;
            let id = tokens.next_usize("bag id")?;
            if id == 0 || id > nbags {
                return Err(InferenceError::parse(source, format!("bag id {} out of range", id)));
            }
            let mut bag = Vec::new();
            for tok in tokens.inner.by_ref() {
                let v: usize = tok
                    .parse()
                    .map_err(|_| InferenceError::parse(source, format!("expected vertex, found {:?}", tok)))?;
                if v == 0 || v > nverts {
                    return Err(InferenceError::parse(source, format!("vertex {} out of range", v)));
                }
                bag.push(v - 1);
            }
            bags[id - 1] = Some(bag);
        } else {
            let (nbags, _, _) = header
                .ok_or_else(|| InferenceError::parse(source, "edge before the 's td' line"))?;
            let a = tokens.next_usize("bag id")?;
            let b = tokens.next_usize("bag id")?;
            if a == 0 || b == 0 || a > nbags || b > nbags {
                return Err(InferenceError::parse(source, format!("edge {} {} out of range", a, b)));
            }
            edges.push((a - 1, b - 1));
        }
    }

    let (num_bags, max_bag_size, num_vertices) =
        header.ok_or_else(|| InferenceError::parse(source, "missing 's td' line"))?;
    let bags = bags
        .into_iter()
        .enumerate()
        .map(|(i, b)| b.ok_or_else(|| InferenceError::parse(source, format!("bag {} is missing", i + 1))))
        .collect::<Result<Vec<_>>>()?;
    Ok(TreeDecomposition {
        num_bags,
        max_bag_size,
        num_vertices,
        bags,
        edges,
    })
}

fn read_text(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)?)
}

fn source_name(path: &Path) -> String {
    path.display().to_string()
}

pub fn read_uai_file(path: &Path) -> Result<UaiInstance> {
    parse_uai(&read_text(path)?, &source_name(path))
}

pub fn read_uai_evid_file(path: &Path) -> Result<Vec<(usize, usize)>> {
    parse_uai_evid(&read_text(path)?, &source_name(path))
}

pub fn read_uai_mar_file(path: &Path) -> Result<Vec<Vec<f64>>> {
    parse_uai_mar(&read_text(path)?, &source_name(path))
}

pub fn read_td_file(path: &Path) -> Result<TreeDecomposition> {
    parse_td(&read_text(path)?, &source_name(path))
}

/// Load a model together with optional evidence and reference marginals.
pub fn uai_problem_from_file(
    uai: &Path,
    evid: Option<&Path>,
    mar: Option<&Path>,
) -> Result<UaiInstance> {
    let mut instance = read_uai_file(uai)?;
    if let Some(evid) = evid {
        instance = instance.set_evidence(read_uai_evid_file(evid)?)?;
    }
    if let Some(mar) = mar {
        instance = instance.with_reference_marginals(read_uai_mar_file(mar)?)?;
    }
    Ok(instance)
}

/// A named collection of problem instances.
pub trait ProblemRepository {
    fn load(&self, name: &str) -> Result<UaiInstance>;

    /// Names of the available problems, sorted.
    fn list(&self) -> Result<Vec<String>>;
}

/// Problems stored as `<name>.uai` with optional `<name>.uai.evid` and
/// `<name>.uai.MAR` next to it.
#[derive(Debug, Clone)]
pub struct DirectoryRepository {
    root: PathBuf,
}

impl DirectoryRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ProblemRepository for DirectoryRepository {
    fn load(&self, name: &str) -> Result<UaiInstance> {
        let uai = self.root.join(format!("{}.uai", name));
        let evid = self.root.join(format!("{}.uai.evid", name));
        let mar = self.root.join(format!("{}.uai.MAR", name));
        uai_problem_from_file(
            &uai,
            evid.is_file().then_some(evid.as_path()),
            mar.is_file().then_some(mar.as_path()),
        )
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".uai") {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const CHAIN: &str = "MARKOV
3
2 2 2
2
2 0 1
2 1 2

4
 2.0 1.0
 1.0 2.0

4
 1.0 1.0
 1.0 3.0
";

    #[test]
    fn test_parse_uai() {
        let inst = parse_uai(CHAIN, "chain.uai").unwrap();
        assert_eq!(inst.nvars, 3);
        assert_eq!(inst.nclique, 2);
        assert_eq!(inst.cards, vec![2, 2, 2]);
        assert_eq!(inst.factors[1].vars(), &[1, 2]);
        // last scope variable varies fastest
        assert_abs_diff_eq!(inst.factors[1].vals()[[1, 1]], 3.0);
        assert_abs_diff_eq!(inst.factors[0].vals()[[0, 1]], 1.0);
        assert!(inst.obsvars.is_empty());
    }

    #[test]
    fn test_parse_uai_errors() {
        assert!(matches!(
            parse_uai("MARKOV 2 2 2 1 2 0 1 4 1.0 1.0", "t"),
            Err(InferenceError::Parse { .. })
        ));
        assert!(parse_uai("MARKOV 1 2 1 1 0 3 1 1 1", "t").is_err());
        assert!(parse_uai("MARKOV 1 2 1 1 4 2 1 1", "t").is_err());
        assert!(parse_uai("GRID 1 2 0", "t").is_err());
        assert!(parse_uai("BAYES 1 2 1 1 0 2 0.5 -0.5", "t").is_err());
    }

    #[test]
    fn test_evidence_and_mar() {
        let pairs = parse_uai_evid("2 0 1 2 0\n", "e").unwrap();
        assert_eq!(pairs, vec![(0, 1), (2, 0)]);
        assert!(parse_uai_evid("", "e").unwrap().is_empty());
        assert!(parse_uai_evid("2 0 1", "e").is_err());
        // multi-sample files: the last line wins
        assert_eq!(parse_uai_evid("1\n1 1 0\n", "e").unwrap(), vec![(1, 0)]);

        let mar = parse_uai_mar("MAR\n2 2 0.25 0.75 3 0.2 0.3 0.5\n", "m").unwrap();
        assert_eq!(mar.len(), 2);
        assert_abs_diff_eq!(mar[1][2], 0.5);
        assert!(parse_uai_mar("PR 1", "m").is_err());
    }

    #[test]
    fn test_set_evidence() {
        let inst = parse_uai(CHAIN, "chain.uai").unwrap();
        let inst = inst.set_evidence([(2, 1), (0, 0)]).unwrap();
        assert_eq!(inst.obsvars, vec![0, 2]);
        assert_eq!(inst.obsvals, vec![0, 1]);
        assert_eq!(inst.evidence().get(&2), Some(&1));

        assert!(matches!(
            inst.clone().set_evidence([(3, 0)]),
            Err(InferenceError::InvalidEvidence(_))
        ));
        assert!(inst.set_evidence([(1, 2)]).is_err());
    }

    #[test]
    fn test_parse_td_and_order() {
        let td = "c chain tree decomposition
s td 2 2 3
b 1 1 2
b 2 2 3
1 2
";
        let dec = parse_td(td, "chain.td").unwrap();
        assert_eq!(dec.num_bags, 2);
        assert_eq!(dec.bags, vec![vec![0, 1], vec![1, 2]]);
        assert_eq!(dec.edges, vec![(0, 1)]);
        assert_eq!(dec.elimination_order(), vec![2, 0, 1]);

        assert!(parse_td("b 1 1", "x").is_err());
        assert!(parse_td("s td 1 1 1\nb 1 2\n", "x").is_err());
        assert!(parse_td("s td 2 1 1\nb 1 1\n", "x").is_err());
    }

    #[test]
    fn test_directory_repository() {
        let dir = std::env::temp_dir().join(format!("tensorinference_repo_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("chain.uai"), CHAIN).unwrap();
        fs::write(dir.join("chain.uai.evid"), "1 1 0\n").unwrap();
        fs::write(dir.join("chain.uai.MAR"), "MAR 3 2 0.5 0.5 2 0.5 0.5 2 0.5 0.5").unwrap();

        let repo = DirectoryRepository::new(&dir);
        assert_eq!(repo.list().unwrap(), vec!["chain".to_string()]);
        let inst = repo.load("chain").unwrap();
        assert_eq!(inst.evidence().get(&1), Some(&0));
        assert_eq!(inst.reference_marginals.as_ref().map(Vec::len), Some(3));
        assert!(repo.load("missing").is_err());

        fs::remove_dir_all(&dir).ok();
    }
}
