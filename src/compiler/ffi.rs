//! # C FFI metadata
//!
//! The compiler core never parses C headers. A symbol provider hands it
//! prototypes for imported functions; the concrete carrier is a JSON
//! manifest, with a seeded table of common libc entry points as the
//! fallback so `import c "libc.so.6"` works out of the box.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// C-level types the marshaller understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CType {
    /// No value (returns only)
    Void,
    /// 32-bit signed integer
    Int,
    /// 64-bit signed integer
    Long,
    /// Pointer (strings marshal to NUL-terminated `char*`)
    Ptr,
    /// IEEE-754 double
    Double,
}

impl CType {
    /// True if the argument travels in an SSE register
    pub fn is_fp(self) -> bool {
        matches!(self, CType::Double)
    }
}

/// Signature of an imported C function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prototype {
    /// Argument types in order
    pub args: Vec<CType>,
    /// Return type
    pub ret: CType,
    /// True for `printf`-style variadics
    #[serde(default)]
    pub variadic: bool,
}

/// Source of prototypes for imported functions. The single interaction
/// point between the core and FFI metadata.
pub trait SymbolProvider {
    /// Look up the C signature of `name`, if the provider knows it
    fn resolve(&self, name: &str) -> Option<Prototype>;
}

/// Provider backed by a JSON manifest:
/// `{"puts": {"args": ["ptr"], "ret": "int"}, …}`
#[derive(Debug, Default)]
pub struct ManifestProvider {
    prototypes: HashMap<String, Prototype>,
}

impl ManifestProvider {
    /// Parse a manifest from JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        let prototypes: HashMap<String, Prototype> =
            serde_json::from_str(json).map_err(|e| Error::Io {
                path: "<ffi manifest>".into(),
                message: e.to_string(),
            })?;
        Ok(Self { prototypes })
    }
}

impl SymbolProvider for ManifestProvider {
    fn resolve(&self, name: &str) -> Option<Prototype> {
        self.prototypes.get(name).cloned()
    }
}

/// Seeded prototypes for common libc entry points, used when no
/// manifest is supplied
#[derive(Debug, Default)]
pub struct KnownLibcProvider;

impl SymbolProvider for KnownLibcProvider {
    fn resolve(&self, name: &str) -> Option<Prototype> {
        let (args, ret, variadic): (&[CType], CType, bool) = match name {
            "puts" => (&[CType::Ptr], CType::Int, false),
            "putchar" => (&[CType::Int], CType::Int, false),
            "printf" => (&[CType::Ptr], CType::Int, true),
            "fflush" => (&[CType::Ptr], CType::Int, false),
            "malloc" => (&[CType::Long], CType::Ptr, false),
            "calloc" => (&[CType::Long, CType::Long], CType::Ptr, false),
            "free" => (&[CType::Ptr], CType::Void, false),
            "strlen" => (&[CType::Ptr], CType::Long, false),
            "getenv" => (&[CType::Ptr], CType::Ptr, false),
            "exit" => (&[CType::Int], CType::Void, false),
            "abs" => (&[CType::Int], CType::Int, false),
            "atoi" => (&[CType::Ptr], CType::Int, false),
            "sqrt" => (&[CType::Double], CType::Double, false),
            "pow" => (&[CType::Double, CType::Double], CType::Double, false),
            "fmod" => (&[CType::Double, CType::Double], CType::Double, false),
            "usleep" => (&[CType::Int], CType::Int, false),
            _ => return None,
        };
        Some(Prototype {
            args: args.to_vec(),
            ret,
            variadic,
        })
    }
}

/// Chain: manifest first, then the seeded table
pub struct ProviderChain {
    providers: Vec<Box<dyn SymbolProvider>>,
}

impl ProviderChain {
    /// Build a chain from an optional manifest
    pub fn new(manifest: Option<ManifestProvider>) -> Self {
        let mut providers: Vec<Box<dyn SymbolProvider>> = Vec::new();
        if let Some(m) = manifest {
            providers.push(Box::new(m));
        }
        providers.push(Box::new(KnownLibcProvider));
        Self { providers }
    }
}

impl SymbolProvider for ProviderChain {
    fn resolve(&self, name: &str) -> Option<Prototype> {
        self.providers.iter().find_map(|p| p.resolve(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips() {
        let json = r#"{
            "puts": {"args": ["ptr"], "ret": "int"},
            "printf": {"args": ["ptr"], "ret": "int", "variadic": true}
        }"#;
        let p = ManifestProvider::from_json(json).unwrap();
        let puts = p.resolve("puts").unwrap();
        assert_eq!(puts.args, vec![CType::Ptr]);
        assert_eq!(puts.ret, CType::Int);
        assert!(!puts.variadic);
        assert!(p.resolve("printf").unwrap().variadic);
        assert!(p.resolve("unknown").is_none());
    }

    #[test]
    fn known_libc_covers_scenarios() {
        let p = KnownLibcProvider;
        assert!(p.resolve("puts").is_some());
        assert!(p.resolve("printf").unwrap().variadic);
        assert!(p.resolve("definitely_not_libc").is_none());
    }

    #[test]
    fn chain_prefers_manifest() {
        let json = r#"{"puts": {"args": ["ptr", "int"], "ret": "long"}}"#;
        let chain = ProviderChain::new(Some(ManifestProvider::from_json(json).unwrap()));
        let puts = chain.resolve("puts").unwrap();
        assert_eq!(puts.args.len(), 2, "manifest overrides the seeded table");
        assert!(chain.resolve("strlen").is_some(), "falls through to libc");
    }

    #[test]
    fn bad_manifest_is_rejected() {
        assert!(ManifestProvider::from_json("not json").is_err());
    }
}
