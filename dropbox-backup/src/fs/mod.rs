//! Local filesystem side of a backup: walking, metadata, hashing and
//! backup-set selection.

pub mod fingerprint;
pub mod metadata;
pub mod selection;
pub mod walker;
