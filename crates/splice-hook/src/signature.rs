// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Routine signatures and the cloner that gives hooks their own copy.
//!
//! A hook that installs a signature must not share storage with whoever
//! defined it: the definer may go away first. `SignatureArena::clone_from`
//! makes a deep copy (fresh allocations for every name) and hands back a
//! `ClonedSignature` that releases itself exactly once, on drop.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Declared type of a parameter or return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    Any,
    Named(Arc<str>),
    Nullable(Box<TypeRef>),
    Union(Vec<TypeRef>),
}

impl TypeRef {
    pub fn named(name: &str) -> Self {
        TypeRef::Named(Arc::from(name))
    }

    fn deep_clone(&self) -> Self {
        match self {
            TypeRef::Any => TypeRef::Any,
            TypeRef::Named(name) => TypeRef::Named(Arc::from(&**name)),
            TypeRef::Nullable(inner) => TypeRef::Nullable(Box::new(inner.deep_clone())),
            TypeRef::Union(members) => {
                TypeRef::Union(members.iter().map(TypeRef::deep_clone).collect())
            }
        }
    }

    /// Visit every class/type name this type mentions.
    pub fn names(&self) -> Vec<&Arc<str>> {
        match self {
            TypeRef::Any => Vec::new(),
            TypeRef::Named(name) => vec![name],
            TypeRef::Nullable(inner) => inner.names(),
            TypeRef::Union(members) => members.iter().flat_map(TypeRef::names).collect(),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Any => write!(f, "mixed"),
            TypeRef::Named(name) => write!(f, "{}", name),
            TypeRef::Nullable(inner) => write!(f, "?{}", inner),
            TypeRef::Union(members) => {
                for (i, m) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, "|")?;
                    }
                    write!(f, "{}", m)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: Arc<str>,
    pub ty: TypeRef,
    pub by_ref: bool,
    /// Default value as written in the declaration.
    pub default: Option<Arc<str>>,
}

impl Param {
    pub fn new(name: &str, ty: TypeRef) -> Self {
        Self {
            name: Arc::from(name),
            ty,
            by_ref: false,
            default: None,
        }
    }

    pub fn by_ref(mut self) -> Self {
        self.by_ref = true;
        self
    }

    pub fn with_default(mut self, default: &str) -> Self {
        self.default = Some(Arc::from(default));
        self
    }

    fn deep_clone(&self) -> Self {
        Self {
            name: Arc::from(&*self.name),
            ty: self.ty.deep_clone(),
            by_ref: self.by_ref,
            default: self.default.as_deref().map(Arc::from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<Param>,
    pub ret: TypeRef,
    /// The last parameter collects any remaining arguments.
    pub variadic: bool,
}

impl Signature {
    pub fn new(params: Vec<Param>, ret: TypeRef) -> Self {
        Self {
            params,
            ret,
            variadic: false,
        }
    }

    /// `(mixed ...$args): mixed`
    pub fn any() -> Self {
        Self {
            params: vec![Param::new("args", TypeRef::Any)],
            ret: TypeRef::Any,
            variadic: true,
        }
    }

    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    /// Parameters without a default.
    pub fn required(&self) -> usize {
        self.params
            .iter()
            .filter(|p| p.default.is_none())
            .count()
            .saturating_sub(self.variadic as usize)
    }

    /// Copy that shares no allocation with `self`.
    pub fn deep_clone(&self) -> Self {
        Self {
            params: self.params.iter().map(Param::deep_clone).collect(),
            ret: self.ret.deep_clone(),
            variadic: self.variadic,
        }
    }

    /// True if no name in `self` points at memory owned by `other`.
    pub fn shares_nothing_with(&self, other: &Signature) -> bool {
        let mine: Vec<&Arc<str>> = self.all_names();
        let theirs: Vec<&Arc<str>> = other.all_names();
        mine.iter()
            .all(|a| theirs.iter().all(|b| !Arc::ptr_eq(a, b)))
    }

    fn all_names(&self) -> Vec<&Arc<str>> {
        let mut names = Vec::new();
        for p in &self.params {
            names.push(&p.name);
            names.extend(p.ty.names());
            names.extend(p.default.as_ref());
        }
        names.extend(self.ret.names());
        names
    }
}

#[derive(Debug, Default)]
struct ArenaStats {
    cloned: AtomicUsize,
    released: AtomicUsize,
}

/// Issues owned signature clones and counts their lifetimes.
#[derive(Debug, Clone, Default)]
pub struct SignatureArena {
    stats: Arc<ArenaStats>,
}

impl SignatureArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clone_from(&self, signature: &Signature) -> ClonedSignature {
        self.stats.cloned.fetch_add(1, Ordering::AcqRel);
        ClonedSignature {
            signature: Arc::new(signature.deep_clone()),
            stats: self.stats.clone(),
        }
    }

    /// Clones handed out and not yet released.
    pub fn live(&self) -> usize {
        self.cloned() - self.released()
    }

    pub fn cloned(&self) -> usize {
        self.stats.cloned.load(Ordering::Acquire)
    }

    pub fn released(&self) -> usize {
        self.stats.released.load(Ordering::Acquire)
    }
}

/// A signature copy with a single owner. Not `Clone`: dropping it is the
/// one and only release.
#[derive(Debug)]
pub struct ClonedSignature {
    signature: Arc<Signature>,
    stats: Arc<ArenaStats>,
}

impl ClonedSignature {
    /// The copy, for installing into a routine table.
    pub fn share(&self) -> Arc<Signature> {
        self.signature.clone()
    }

    pub fn get(&self) -> &Signature {
        &self.signature
    }
}

impl Drop for ClonedSignature {
    fn drop(&mut self) {
        self.stats.released.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curl_setopt() -> Signature {
        Signature::new(
            vec![
                Param::new("handle", TypeRef::named("CurlHandle")),
                Param::new("option", TypeRef::named("int")),
                Param::new(
                    "value",
                    TypeRef::Union(vec![
                        TypeRef::named("string"),
                        TypeRef::Nullable(Box::new(TypeRef::named("array"))),
                    ]),
                ),
            ],
            TypeRef::named("bool"),
        )
    }

    #[test]
    fn deep_clone_is_equal_but_independent() {
        let sig = curl_setopt();
        let copy = sig.deep_clone();
        assert_eq!(sig, copy);
        assert!(copy.shares_nothing_with(&sig));

        // A plain clone shares every name.
        assert!(!sig.clone().shares_nothing_with(&sig));
    }

    #[test]
    fn clone_outlives_the_source() {
        let arena = SignatureArena::new();
        let cloned = {
            let sig = curl_setopt();
            arena.clone_from(&sig)
        };
        assert_eq!(cloned.get().params[0].ty.to_string(), "CurlHandle");
        assert_eq!(cloned.get().params[2].ty.to_string(), "string|?array");
    }

    #[test]
    fn each_clone_released_once() {
        let arena = SignatureArena::new();
        let a = arena.clone_from(&curl_setopt());
        let b = arena.clone_from(&Signature::any());
        let shared = a.share();
        assert_eq!(arena.live(), 2);
        drop(a);
        // Outstanding table references do not keep the clone "live".
        assert_eq!(arena.live(), 1);
        assert_eq!(shared.params.len(), 3);
        drop(b);
        assert_eq!((arena.cloned(), arena.released()), (2, 2));
    }

    #[test]
    fn required_ignores_defaults_and_variadic() {
        let sig = Signature::new(
            vec![
                Param::new("seconds", TypeRef::named("int")),
                Param::new("nanoseconds", TypeRef::named("int")).with_default("0"),
            ],
            TypeRef::named("bool"),
        );
        assert_eq!(sig.required(), 1);
        assert_eq!(Signature::any().required(), 0);
    }
}
