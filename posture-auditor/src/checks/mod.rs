/*!
Built-in checks. Each module registers its checks under its own group.
*/

use serde_json::Value;

use crate::core::error::{CheckError, RegistryError};
use crate::core::registry::CheckRegistry;

pub mod cloudformation;
pub mod ec2;
pub mod shield;
pub mod ssm;

/// Catalog of every built-in check, in a fixed group order
pub fn builtin_registry() -> Result<CheckRegistry, RegistryError> {
    let mut registry = CheckRegistry::new();
    ec2::register(&mut registry)?;
    shield::register(&mut registry)?;
    cloudformation::register(&mut registry)?;
    ssm::register(&mut registry)?;
    Ok(registry)
}

/// Array field of an API response; an empty array is a valid "nothing found"
fn array<'a>(value: &'a Value, key: &str) -> Result<&'a [Value], CheckError> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| CheckError::Response(format!("missing `{key}` array")))
}

fn string<'a>(value: &'a Value, key: &str) -> Result<&'a str, CheckError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| CheckError::Response(format!("missing `{key}` string")))
}
