//! Robust pose-graph optimization.
//!
//! ```text
//! handlers / loop engine
//!          │ new factors + values
//!          ▼
//! ┌──────────────────────────────────────────────────┐
//! │                 RobustSolver                      │
//! │                                                   │
//! │   PCM outlier filter ──▶ assembled factor set     │
//! │          │                       │                │
//! │   max-clique selection     NLLS optimizer         │
//! │                            (LM / GN, opt. GNC)    │
//! └──────────────────────────────────────────────────┘
//!          │ updated values
//!          ▼
//!     graph store
//! ```
//!
//! - [`Optimizer`]: dense Gauss-Newton / Levenberg-Marquardt over SE(3)
//! - [`Pcm`]: pairwise-consistency loop-closure filter
//! - [`MaxCliqueSolver`]: Bron-Kerbosch with greedy fallback
//! - [`optimize_with_gnc`]: graduated non-convexity wrapper
//! - [`RobustSolver`]: the facade the estimate task talks to

mod clique;
mod gnc;
mod optimizer;
mod pcm;
mod robust;

pub use clique::MaxCliqueSolver;
pub use gnc::{optimize_with_gnc, GncResult};
pub use optimizer::{factor_errors, graph_cost, OptimizationOutcome, Optimizer, TerminationReason};
pub use pcm::{ObservationId, Pcm};
pub use robust::{RobustSolver, UpdateOutcome};
