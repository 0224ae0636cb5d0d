//! Procedure catalogue: the compile-time contract between call sites and
//! server procedures.
//!
//! DESIGN
//! ======
//! Each procedure is a unit type implementing [`Procedure`], carrying its
//! wire name, kind, and input/output types. Marker traits restrict the
//! typed client operations to the matching kind, so calling a subscription
//! through `query` does not compile. Catalogues are normally generated with
//! [`procedures!`](crate::procedures); the runtime descriptor list only
//! exists for validation and introspection.

use std::collections::HashSet;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use frames::Kind as ProcedureKind;

/// Names a server refuses to register; the client refuses them too.
const RESERVED_NAMES: &[&str] = &["ws"];
const RESERVED_PREFIX: &str = "rpc.";

/// A server-defined procedure with static input and output types.
pub trait Procedure: Send + Sync + 'static {
    /// Wire name, unique within its kind.
    const NAME: &'static str;
    const KIND: ProcedureKind;

    type Input: Serialize + Send + Sync;
    type Output: DeserializeOwned + Send + 'static;

    #[must_use]
    fn descriptor() -> ProcedureDescriptor {
        ProcedureDescriptor { name: Self::NAME, kind: Self::KIND }
    }
}

/// Read procedure; results are cacheable.
pub trait QueryProcedure: Procedure {}

/// Write procedure; results are never cached.
pub trait MutationProcedure: Procedure {}

/// Stream procedure; each output value is one event.
pub trait SubscriptionProcedure: Procedure {}

/// Runtime view of one catalogue entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProcedureDescriptor {
    pub name: &'static str,
    pub kind: ProcedureKind,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CatalogueError {
    #[error("{kind} procedure has an empty name")]
    EmptyName { kind: ProcedureKind },
    #[error("{kind} procedure name `{name}` is reserved")]
    ReservedName { kind: ProcedureKind, name: &'static str },
    #[error("{kind} procedure `{name}` is declared more than once")]
    Duplicate { kind: ProcedureKind, name: &'static str },
}

/// A closed set of procedures exposed by one server.
pub trait Catalogue {
    fn descriptors() -> Vec<ProcedureDescriptor>;

    /// Check names the way the server registers them.
    ///
    /// # Errors
    ///
    /// Returns the first empty, reserved or duplicated name.
    fn validate() -> Result<Vec<ProcedureDescriptor>, CatalogueError> {
        let descriptors = Self::descriptors();
        validate_descriptors(&descriptors)?;
        Ok(descriptors)
    }
}

/// Validate a descriptor list. Names only need to be unique within a kind.
///
/// # Errors
///
/// See [`Catalogue::validate`].
pub fn validate_descriptors(descriptors: &[ProcedureDescriptor]) -> Result<(), CatalogueError> {
    let mut seen = HashSet::new();
    for d in descriptors {
        if d.name.is_empty() {
            return Err(CatalogueError::EmptyName { kind: d.kind });
        }
        if RESERVED_NAMES.contains(&d.name) || d.name.starts_with(RESERVED_PREFIX) {
            return Err(CatalogueError::ReservedName { kind: d.kind, name: d.name });
        }
        if !seen.insert((d.kind, d.name)) {
            return Err(CatalogueError::Duplicate { kind: d.kind, name: d.name });
        }
    }
    Ok(())
}

/// Declare a procedure catalogue.
///
/// ```
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize)]
/// pub struct UserId {
///     pub id: u32,
/// }
///
/// #[derive(Deserialize)]
/// pub struct User {
///     pub id: u32,
///     pub name: String,
/// }
///
/// rpclink::procedures! {
///     pub catalogue Api {
///         query GetUser("getUser"): UserId => User;
///         subscription UserEvents("userEvents"): UserId => User;
///     }
/// }
///
/// use rpclink::procedure::{Catalogue, Procedure};
/// assert_eq!(GetUser::NAME, "getUser");
/// assert_eq!(Api::descriptors().len(), 2);
/// ```
#[macro_export]
macro_rules! procedures {
    (
        $(#[$meta:meta])*
        $vis:vis catalogue $catalogue:ident {
            $( $kind:ident $name:ident ($key:literal): $input:ty => $output:ty; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        $vis struct $catalogue;

        $( $crate::procedures!(@procedure $vis $kind $name $key $input, $output); )*

        impl $crate::procedure::Catalogue for $catalogue {
            fn descriptors() -> ::std::vec::Vec<$crate::procedure::ProcedureDescriptor> {
                ::std::vec![
                    $( <$name as $crate::procedure::Procedure>::descriptor(), )*
                ]
            }
        }
    };
    (@procedure $vis:vis query $name:ident $key:literal $input:ty, $output:ty) => {
        $crate::procedures!(@define $vis $name $key Query $input, $output);
        impl $crate::procedure::QueryProcedure for $name {}
    };
    (@procedure $vis:vis mutation $name:ident $key:literal $input:ty, $output:ty) => {
        $crate::procedures!(@define $vis $name $key Mutation $input, $output);
        impl $crate::procedure::MutationProcedure for $name {}
    };
    (@procedure $vis:vis subscription $name:ident $key:literal $input:ty, $output:ty) => {
        $crate::procedures!(@define $vis $name $key Subscription $input, $output);
        impl $crate::procedure::SubscriptionProcedure for $name {}
    };
    (@define $vis:vis $name:ident $key:literal $kind:ident $input:ty, $output:ty) => {
        #[derive(Debug, Clone, Copy, Default)]
        $vis struct $name;

        impl $crate::procedure::Procedure for $name {
            const NAME: &'static str = $key;
            const KIND: $crate::procedure::ProcedureKind = $crate::procedure::ProcedureKind::$kind;
            type Input = $input;
            type Output = $output;
        }
    };
}

#[cfg(test)]
#[path = "procedure_test.rs"]
mod tests;
