//! The typed SELECT builder.

use crate::clause::OrderSpec;
use crate::expr::Expr;
use crate::materialize::{FromTuple, Tuple};
use crate::path::EntityPath;
use crate::plan::JoinKind;
use entkit_core::{Entity, EntityDescriptor, FromValue, Managed, Result, Value};
use std::collections::HashMap;
use std::fmt;

/// An aliased entity introduced by `from` or a join.
#[derive(Debug, Clone)]
pub struct Source {
    pub entity: &'static EntityDescriptor,
    pub alias: String,
}

impl Source {
    pub fn of<E: Entity>(path: &EntityPath<E>) -> Self {
        Self {
            entity: E::descriptor(),
            alias: path.alias().to_string(),
        }
    }
}

/// One projected item.
#[derive(Debug, Clone)]
pub enum Projection {
    /// A whole entity
    Entity(Source),
    /// A scalar expression
    Expr(Expr),
}

impl Projection {
    pub fn entity<E: Entity>(path: &EntityPath<E>) -> Self {
        Projection::Entity(Source::of(path))
    }
}

impl From<Expr> for Projection {
    fn from(expr: Expr) -> Self {
        Projection::Expr(expr)
    }
}

/// How a join is connected to the query.
#[derive(Debug, Clone)]
pub enum JoinEdge {
    /// Along a relationship of an already-introduced alias
    Relation { owner: String, relation: String },
    /// Unrelated entity; the condition comes from `on`
    Theta,
}

#[derive(Debug, Clone)]
pub struct JoinSpec {
    pub kind: JoinKind,
    pub target: Source,
    pub edge: JoinEdge,
    /// Populate the relationship from this join
    pub fetch: bool,
    /// Extra (or, for theta joins, the only) join condition
    pub on: Option<Expr>,
}

/// The uncompiled shape of a query.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub from: Option<Source>,
    pub projections: Vec<Projection>,
    pub joins: Vec<JoinSpec>,
    pub filters: Vec<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Vec<Expr>,
    pub order_by: Vec<OrderSpec>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub distinct: bool,
    pub bindings: HashMap<String, Value>,
    /// Restrict the root to one subtype of its hierarchy
    pub subtype: Option<String>,
    /// An `on` condition given before any join; rejected at compile time
    pub stray_on: Option<Expr>,
}

impl QuerySpec {
    /// The root source: `from`, or the first projected entity.
    pub fn root(&self) -> Option<&Source> {
        self.from.as_ref().or_else(|| {
            self.projections.iter().find_map(|p| match p {
                Projection::Entity(source) => Some(source),
                Projection::Expr(_) => None,
            })
        })
    }
}

/// A query producing values of type `O`.
///
/// ```ignore
/// let m = EntityPath::<Member>::new("m");
/// let t = EntityPath::<Team>::new("t");
/// let members = select_from(&m)
///     .fetch_join(&m, "team", &t)
///     .filter(m.get("age").ge(20))
///     .order_by(m.get("age").desc())
///     .fetch(&cx, &mut ctx)
///     .await;
/// ```
pub struct Select<O> {
    spec: QuerySpec,
    materializer: fn(Tuple) -> Result<O>,
}

fn first_entity<E: Entity>(tuple: Tuple) -> Result<Managed<E>> {
    tuple.required_entity(0)
}

fn first_value(tuple: Tuple) -> Result<Value> {
    tuple.get_as(0)
}

fn first_scalar<T: FromValue>(tuple: Tuple) -> Result<T> {
    tuple.get_as(0)
}

fn whole_tuple(tuple: Tuple) -> Result<Tuple> {
    Ok(tuple)
}

/// Select entity `E` from its own path.
pub fn select_from<E: Entity>(path: &EntityPath<E>) -> Select<Managed<E>> {
    let source = Source::of(path);
    Select::with_spec(
        QuerySpec {
            from: Some(source.clone()),
            projections: vec![Projection::Entity(source)],
            ..QuerySpec::default()
        },
        first_entity::<E>,
    )
}

/// Select entity `E`, typically a joined alias; pair with `from`.
pub fn select_entity<E: Entity>(path: &EntityPath<E>) -> Select<Managed<E>> {
    Select::with_spec(
        QuerySpec {
            projections: vec![Projection::entity(path)],
            ..QuerySpec::default()
        },
        first_entity::<E>,
    )
}

/// Select one expression as a raw value.
pub fn select_one(expr: Expr) -> Select<Value> {
    Select::with_spec(
        QuerySpec {
            projections: vec![Projection::Expr(expr)],
            ..QuerySpec::default()
        },
        first_value,
    )
}

/// Select one expression converted to `T`.
pub fn select_scalar<T: FromValue>(expr: Expr) -> Select<T> {
    Select::with_spec(
        QuerySpec {
            projections: vec![Projection::Expr(expr)],
            ..QuerySpec::default()
        },
        first_scalar::<T>,
    )
}

/// Select several items as tuples.
pub fn select(projections: Vec<Projection>) -> Select<Tuple> {
    Select::with_spec(
        QuerySpec {
            projections,
            ..QuerySpec::default()
        },
        whole_tuple,
    )
}

/// Select several items and build a `D` from each tuple.
pub fn select_as<D: FromTuple>(projections: Vec<Projection>) -> Select<D> {
    Select::with_spec(
        QuerySpec {
            projections,
            ..QuerySpec::default()
        },
        D::from_tuple,
    )
}

impl<O> Select<O> {
    fn with_spec(spec: QuerySpec, materializer: fn(Tuple) -> Result<O>) -> Self {
        Self { spec, materializer }
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    pub fn into_spec(self) -> QuerySpec {
        self.spec
    }

    pub(crate) fn materializer(&self) -> fn(Tuple) -> Result<O> {
        self.materializer
    }

    pub(crate) fn map_spec(&self, f: impl FnOnce(&mut QuerySpec)) -> Self {
        let mut spec = self.spec.clone();
        f(&mut spec);
        Self {
            spec,
            materializer: self.materializer,
        }
    }

    /// Set the root entity.
    pub fn from<E: Entity>(mut self, path: &EntityPath<E>) -> Self {
        self.spec.from = Some(Source::of(path));
        self
    }

    fn push_join<A: Entity, B: Entity>(
        mut self,
        kind: JoinKind,
        owner: &EntityPath<A>,
        relation: &str,
        target: &EntityPath<B>,
        fetch: bool,
    ) -> Self {
        self.spec.joins.push(JoinSpec {
            kind,
            target: Source::of(target),
            edge: JoinEdge::Relation {
                owner: owner.alias().to_string(),
                relation: relation.to_string(),
            },
            fetch,
            on: None,
        });
        self
    }

    /// Inner join along `owner.relation`, introducing `target`.
    pub fn join<A: Entity, B: Entity>(
        self,
        owner: &EntityPath<A>,
        relation: &str,
        target: &EntityPath<B>,
    ) -> Self {
        self.push_join(JoinKind::Inner, owner, relation, target, false)
    }

    /// Left join along `owner.relation`.
    pub fn left_join<A: Entity, B: Entity>(
        self,
        owner: &EntityPath<A>,
        relation: &str,
        target: &EntityPath<B>,
    ) -> Self {
        self.push_join(JoinKind::Left, owner, relation, target, false)
    }

    /// Inner join that also populates `owner.relation` from the result.
    pub fn fetch_join<A: Entity, B: Entity>(
        self,
        owner: &EntityPath<A>,
        relation: &str,
        target: &EntityPath<B>,
    ) -> Self {
        self.push_join(JoinKind::Inner, owner, relation, target, true)
    }

    /// Left join that also populates `owner.relation`.
    pub fn left_fetch_join<A: Entity, B: Entity>(
        self,
        owner: &EntityPath<A>,
        relation: &str,
        target: &EntityPath<B>,
    ) -> Self {
        self.push_join(JoinKind::Left, owner, relation, target, true)
    }

    fn push_theta<B: Entity>(mut self, kind: JoinKind, target: &EntityPath<B>) -> Self {
        self.spec.joins.push(JoinSpec {
            kind,
            target: Source::of(target),
            edge: JoinEdge::Theta,
            fetch: false,
            on: None,
        });
        self
    }

    /// Inner join with an unrelated entity. Without `on` this is a cross join.
    pub fn join_on<B: Entity>(self, target: &EntityPath<B>) -> Self {
        self.push_theta(JoinKind::Inner, target)
    }

    /// Left join with an unrelated entity; requires `on`.
    pub fn left_join_on<B: Entity>(self, target: &EntityPath<B>) -> Self {
        self.push_theta(JoinKind::Left, target)
    }

    /// Add a condition to the most recent join.
    pub fn on(mut self, predicate: Expr) -> Self {
        let slot = match self.spec.joins.last_mut() {
            Some(join) => &mut join.on,
            None => &mut self.spec.stray_on,
        };
        *slot = Some(match slot.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    /// Add a WHERE predicate. `None` adds nothing.
    pub fn filter(mut self, predicate: impl Into<Option<Expr>>) -> Self {
        if let Some(predicate) = predicate.into() {
            self.spec.filters.push(predicate);
        }
        self
    }

    /// Add several WHERE predicates, skipping `None`s.
    pub fn filter_all<I>(mut self, predicates: I) -> Self
    where
        I: IntoIterator<Item = Option<Expr>>,
    {
        self.spec.filters.extend(predicates.into_iter().flatten());
        self
    }

    pub fn group_by(mut self, expr: Expr) -> Self {
        self.spec.group_by.push(expr);
        self
    }

    pub fn having(mut self, predicate: Expr) -> Self {
        self.spec.having.push(predicate);
        self
    }

    pub fn order_by(mut self, order: impl Into<OrderSpec>) -> Self {
        self.spec.order_by.push(order.into());
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.spec.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.spec.limit = Some(limit);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.spec.distinct = true;
        self
    }

    /// Bind a named parameter.
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.spec.bindings.insert(name.into(), value.into());
        self
    }

    /// Only return root rows of the named subtype.
    pub fn of_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.spec.subtype = Some(subtype.into());
        self
    }
}

impl<O> Clone for Select<O> {
    fn clone(&self) -> Self {
        Self {
            spec: self.spec.clone(),
            materializer: self.materializer,
        }
    }
}

impl<O> fmt::Debug for Select<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Select").field("spec", &self.spec).finish()
    }
}
