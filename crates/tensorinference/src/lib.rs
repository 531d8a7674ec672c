//! Exact inference on discrete graphical models by tensor-network contraction.
//!
//! A factor graph is compiled into a tensor network (one tensor per factor
//! plus one all-ones vector per variable) and contracted along a
//! [`ContractionTree`] under a semiring:
//!
//! - **Real** (sum-product) over [`RescaledArray`]s: partition function and,
//!   with one adjoint pass, the marginals of every variable.
//! - **Tropical** (max-plus) over log values: the maximum log-probability and,
//!   with the tropical backward pass, an assignment attaining it.
//!
//! # Architecture
//!
//! ```text
//! UAI files → UaiInstance → TensorNetworkModel / MMAPModel → queries
//!                                 ↓
//!          ContractionPlanner → ContractionTree → evaluate::<Semiring, _>
//! ```
//!
//! # Example
//!
//! ```
//! use scirs2_core::ndarray::{Array, ArrayD};
//! use tensorinference::{Factor, TensorNetworkModel};
//!
//! let table = |v: Vec<f64>| Array::from_shape_vec(vec![2, 2], v).unwrap().into_dyn();
//! let f_ab = Factor::new(vec![0, 1], table(vec![2.0, 1.0, 1.0, 2.0])).unwrap();
//! let f_bc = Factor::new(vec![1, 2], table(vec![1.0, 1.0, 1.0, 3.0])).unwrap();
//! let model = TensorNetworkModel::builder(vec![0, 1, 2], vec![2, 2, 2], vec![f_ab, f_bc])
//!     .build()
//!     .unwrap();
//!
//! let z: ArrayD<f64> = model.probability().unwrap();
//! assert!((z[[]] - 18.0).abs() < 1e-9);
//!
//! let (logp, config) = model.most_probable_config().unwrap();
//! assert_eq!(config, vec![1, 1, 1]);
//! assert!((logp - 6f64.ln()).abs() < 1e-9);
//! ```

pub mod backward;
mod contraction;
pub mod einsum;
mod error;
mod factor;
mod mmap;
mod model;
mod planner;
mod rescaled;
mod semiring;
pub mod uai;

pub use contraction::{
    CachedTree, ContractionDag, ContractionOptions, ContractionTree, DagNode, DagOp, SemiringTensor,
};
pub use einsum::{EinCode, SizeDict};
pub use error::{InferenceError, Result};
pub use factor::Factor;
pub use mmap::{Clusterer, ConnectedClusters, MMAPModel, MMAPModelBuilder};
pub use model::{TensorNetworkModel, TensorNetworkModelBuilder};
pub use planner::{ContractionPlanner, EliminationPlanner, EliminationStrategy};
pub use rescaled::{rescale_array, RescaledArray};
pub use semiring::{Real, Semiring, Tropical};
pub use uai::{
    parse_td, parse_uai, parse_uai_evid, parse_uai_mar, read_td_file, read_uai_evid_file,
    read_uai_file, read_uai_mar_file, uai_problem_from_file, DirectoryRepository,
    ProblemRepository, TreeDecomposition, UaiInstance,
};
