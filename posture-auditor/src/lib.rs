/*!
Cloud security posture auditor.

Checks register themselves into a [`core::registry::CheckRegistry`], the
[`core::engine::AuditEngine`] runs them against one account and region with a
shared run cache, and the resulting findings are handed to every configured
output provider.
*/

pub mod checks;
pub mod core;

pub use crate::core::auditor::{AuditSummary, Auditor, create_auditor_from_config_file};
pub use crate::core::error::AuditError;
pub use crate::core::finding::Finding;
