//! Materialized context views
//!
//! Read-optimized bundles derived from the entity graph, one per scope:
//!
//! - `world`: every entity, included in every regeneration pass
//! - `group-<id>`: one bundle per group that qualified for a dedicated artifact
//! - `minor-groups`: shared overflow bundle for all other groups
//!
//! Mutations are mapped to the scopes they affect and rebuilt after a
//! debounce delay by the [`ViewEngine`]. Rebuilds are full and deterministic.

pub mod debounce;
pub mod discovery;
pub mod engine;
pub mod generator;
pub mod registry;
pub mod scope;

pub use debounce::Debouncer;
pub use discovery::{discover_groups, Discovery, GroupMetrics, Thresholds};
pub use engine::{PassReport, ScopeFailure, ViewEngine};
pub use generator::{Bundle, BundleFile, ViewError, INDEX_FILE};
pub use registry::{Artifact, ArtifactRegistry, ArtifactSummary, AuditEntry, Trigger};
pub use scope::ArtifactScope;
