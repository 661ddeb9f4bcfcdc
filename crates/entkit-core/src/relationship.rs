//! Relationship metadata.
//!
//! Relationships are static metadata on each entity descriptor. The owning
//! side of an edge carries the foreign key (or the join table); the inverse
//! side names the owning relationship through `mapped_by` and is never
//! written. Keeping both navigable sides in agreement is the caller's job.

/// The cardinality of a relationship edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelationshipKind {
    /// One-to-one: `Member` has one `Locker`.
    OneToOne,
    /// Many-to-one: many `Member`s belong to one `Team`.
    #[default]
    ManyToOne,
    /// One-to-many: one `Team` has many `Member`s.
    OneToMany,
    /// Many-to-many: `Member`s have many `Product`s via a join table.
    ManyToMany,
}

impl RelationshipKind {
    /// Whether the edge holds at most one target.
    pub const fn is_singular(&self) -> bool {
        matches!(self, RelationshipKind::OneToOne | RelationshipKind::ManyToOne)
    }
}

/// When an edge is loaded by `find`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchType {
    /// A proxy is created; the target loads on first resolution.
    #[default]
    Lazy,
    /// The target is resolved right after the owner loads.
    Eager,
}

/// Operations that can propagate across an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeOp {
    Persist,
    Remove,
    Refresh,
}

impl CascadeOp {
    const fn bit(self) -> u8 {
        match self {
            CascadeOp::Persist => 0b001,
            CascadeOp::Remove => 0b010,
            CascadeOp::Refresh => 0b100,
        }
    }
}

/// Set of operations an edge propagates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cascade(u8);

impl Cascade {
    pub const NONE: Cascade = Cascade(0);
    pub const PERSIST: Cascade = Cascade(CascadeOp::Persist.bit());
    pub const REMOVE: Cascade = Cascade(CascadeOp::Remove.bit());
    pub const REFRESH: Cascade = Cascade(CascadeOp::Refresh.bit());
    pub const ALL: Cascade = Cascade(0b111);

    /// Combine two policies.
    pub const fn union(self, other: Cascade) -> Cascade {
        Cascade(self.0 | other.0)
    }

    /// Whether the policy includes `op`.
    pub const fn includes(self, op: CascadeOp) -> bool {
        self.0 & op.bit() != 0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Join table for an owning many-to-many edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinTableInfo {
    pub table: &'static str,
    /// Column referencing the owning entity
    pub owner_column: &'static str,
    /// Column referencing the target entity
    pub target_column: &'static str,
}

/// Metadata about a relationship edge.
#[derive(Debug, Clone, Copy)]
pub struct RelationshipInfo {
    /// Field name on the declaring entity (also the query path)
    pub name: &'static str,
    /// Name of the target entity
    pub target: &'static str,
    pub kind: RelationshipKind,
    /// FK column on the declaring table (owning to-one edges)
    pub join_column: Option<&'static str>,
    /// Join table (owning many-to-many edges)
    pub join_table: Option<JoinTableInfo>,
    /// Owning relationship on the target (inverse edges)
    pub mapped_by: Option<&'static str>,
    pub cascade: Cascade,
    pub fetch: FetchType,
    /// Whether the FK may be NULL
    pub optional: bool,
    /// Whether flushes write the FK column
    pub writable: bool,
}

impl RelationshipInfo {
    /// Create a relationship with only the required data.
    pub const fn new(name: &'static str, target: &'static str, kind: RelationshipKind) -> Self {
        Self {
            name,
            target,
            kind,
            join_column: None,
            join_table: None,
            mapped_by: None,
            cascade: Cascade::NONE,
            fetch: FetchType::Lazy,
            optional: true,
            writable: true,
        }
    }

    /// Owning many-to-one edge stored in `join_column`.
    pub const fn many_to_one(
        name: &'static str,
        target: &'static str,
        join_column: &'static str,
    ) -> Self {
        Self::new(name, target, RelationshipKind::ManyToOne).join_column(join_column)
    }

    /// Inverse one-to-many edge mapped by `mapped_by` on the target.
    pub const fn one_to_many(
        name: &'static str,
        target: &'static str,
        mapped_by: &'static str,
    ) -> Self {
        Self::new(name, target, RelationshipKind::OneToMany).mapped_by(mapped_by)
    }

    /// Owning one-to-one edge stored in `join_column`.
    pub const fn one_to_one(
        name: &'static str,
        target: &'static str,
        join_column: &'static str,
    ) -> Self {
        Self::new(name, target, RelationshipKind::OneToOne).join_column(join_column)
    }

    /// Many-to-many edge; call `join_table` for the owning side or
    /// `mapped_by` for the inverse side.
    pub const fn many_to_many(name: &'static str, target: &'static str) -> Self {
        Self::new(name, target, RelationshipKind::ManyToMany)
    }

    /// Set the FK column.
    pub const fn join_column(mut self, column: &'static str) -> Self {
        self.join_column = Some(column);
        self
    }

    /// Set the join table.
    pub const fn join_table(
        mut self,
        table: &'static str,
        owner_column: &'static str,
        target_column: &'static str,
    ) -> Self {
        self.join_table = Some(JoinTableInfo {
            table,
            owner_column,
            target_column,
        });
        self
    }

    /// Mark this as the inverse side of `owning` on the target.
    pub const fn mapped_by(mut self, owning: &'static str) -> Self {
        self.mapped_by = Some(owning);
        self
    }

    /// Set the cascade policy.
    pub const fn cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    /// Set the fetch type.
    pub const fn fetch(mut self, fetch: FetchType) -> Self {
        self.fetch = fetch;
        self
    }

    /// Set whether the FK may be NULL.
    pub const fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    /// Make the FK read-only (neither inserted nor updated).
    pub const fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    /// Whether this side carries the FK or the join table.
    pub const fn is_owning(&self) -> bool {
        self.join_column.is_some() || self.join_table.is_some()
    }
}
