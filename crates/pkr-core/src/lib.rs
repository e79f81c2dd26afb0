//! pkr Core - Core types shared by the pkr crates
//!
//! This crate provides:
//! - `Meta`: meta values with deep merge support
//! - `MetaStore`: ranked meta sources folded into one mapping
//! - `Environment`: environment files, imports and feature add-ins
//! - `PkrRoot`: discovery of the working tree
//! - `KardStore`: persisted kards

pub mod environment;
pub mod error;
pub mod kard;
pub mod layout;
pub mod meta;
pub mod source;

pub use environment::{ContainerGroup, Environment, ExtraTemplate, RequireRule, RequireSpec};
pub use error::{CoreError, Result};
pub use kard::{KardRecord, KardStatus, KardStore, StoredKard, write_atomic};
pub use layout::PkrRoot;
pub use meta::{Meta, deep_merge, lookup, parse_extra};
pub use source::{MetaSource, MetaStore, SourceKind};
