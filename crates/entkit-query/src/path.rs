//! Typed query roots.

use crate::expr::Expr;
use entkit_core::{Entity, EntityDescriptor};
use std::fmt;
use std::marker::PhantomData;

/// An aliased entity in a query: `let m = EntityPath::<Member>::new("m");`.
///
/// The type parameter ties joins and projections to the entity they name;
/// field names are checked when the query is compiled.
pub struct EntityPath<E: Entity> {
    alias: String,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> EntityPath<E> {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            _entity: PhantomData,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn descriptor(&self) -> &'static EntityDescriptor {
        E::descriptor()
    }

    /// A field path: a plain field, `embedded.field`, the id, a subtype
    /// field, or an owning to-one relationship (compared by key).
    pub fn get(&self, field: &str) -> Expr {
        Expr::path(self.alias.clone(), field)
    }

    /// The primary key path.
    pub fn id(&self) -> Expr {
        self.get(E::descriptor().id.field)
    }
}

impl<E: Entity> Clone for EntityPath<E> {
    fn clone(&self) -> Self {
        Self::new(self.alias.clone())
    }
}

impl<E: Entity> fmt::Debug for EntityPath<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityPath<{}>({})", E::descriptor().name, self.alias)
    }
}
