//! Registry of entity descriptors.
//!
//! Registration is the one place where relationships between entities are
//! checked: targets must exist, inverse sides must point at an owning side,
//! and an inheritance hierarchy must not reuse column names.

use crate::Result;
use crate::descriptor::EntityDescriptor;
use crate::entity::Entity;
use crate::error::Error;
use crate::relationship::{RelationshipInfo, RelationshipKind};
use std::collections::{HashMap, HashSet};

/// Validated set of entity descriptors.
#[derive(Debug, Default)]
pub struct Metamodel {
    entities: HashMap<&'static str, &'static EntityDescriptor>,
    order: Vec<&'static str>,
}

/// Collects descriptors before validation.
#[derive(Debug, Default)]
pub struct MetamodelBuilder {
    descriptors: Vec<&'static EntityDescriptor>,
}

impl MetamodelBuilder {
    /// Register an entity type.
    pub fn register<E: Entity>(self) -> Self {
        self.register_descriptor(E::descriptor())
    }

    /// Register a descriptor directly.
    pub fn register_descriptor(mut self, descriptor: &'static EntityDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Validate and freeze the registry.
    pub fn build(self) -> Result<Metamodel> {
        let mut model = Metamodel::default();
        for descriptor in self.descriptors {
            if model.entities.insert(descriptor.name, descriptor).is_some() {
                return Err(Error::mapping(descriptor.name, "entity registered twice"));
            }
            model.order.push(descriptor.name);
        }
        for descriptor in model.entities() {
            validate_columns(descriptor)?;
            for relation in descriptor.relationships {
                model.validate_relation(descriptor, relation)?;
            }
        }
        tracing::debug!(entities = model.order.len(), "Metamodel built");
        Ok(model)
    }
}

impl Metamodel {
    pub fn builder() -> MetamodelBuilder {
        MetamodelBuilder::default()
    }

    /// Look up a descriptor by entity name.
    pub fn get(&self, name: &str) -> Option<&'static EntityDescriptor> {
        self.entities.get(name).copied()
    }

    /// Look up a descriptor, failing with a mapping error.
    pub fn require(&self, name: &str) -> Result<&'static EntityDescriptor> {
        self.get(name)
            .ok_or_else(|| Error::Custom(format!("entity '{}' is not registered", name)))
    }

    /// Whether `descriptor` is the registered descriptor of its name.
    pub fn contains(&self, descriptor: &EntityDescriptor) -> bool {
        self.get(descriptor.name)
            .is_some_and(|d| std::ptr::eq(d, descriptor))
    }

    /// Registered descriptors in registration order.
    pub fn entities(&self) -> impl Iterator<Item = &'static EntityDescriptor> + '_ {
        self.order.iter().filter_map(|name| self.get(name))
    }

    /// The owning relationship an inverse relationship is mapped by.
    pub fn owning_side(
        &self,
        relation: &RelationshipInfo,
    ) -> Result<(&'static EntityDescriptor, &'static RelationshipInfo)> {
        let target = self.require(relation.target)?;
        let Some(mapped_by) = relation.mapped_by else {
            return Err(Error::mapping(
                target.name,
                format!("relationship '{}' is not an inverse side", relation.name),
            ));
        };
        let owning = target.relationship(mapped_by).ok_or_else(|| {
            Error::mapping(
                target.name,
                format!("no relationship '{}' for mapped_by", mapped_by),
            )
        })?;
        Ok((target, owning))
    }

    fn validate_relation(
        &self,
        owner: &'static EntityDescriptor,
        relation: &'static RelationshipInfo,
    ) -> Result<()> {
        let Some(target) = self.get(relation.target) else {
            return Err(Error::mapping(
                owner.name,
                format!(
                    "relationship '{}' targets unregistered entity '{}'",
                    relation.name, relation.target
                ),
            ));
        };

        let owning = relation.is_owning();
        if owning == relation.mapped_by.is_some() {
            return Err(Error::mapping(
                owner.name,
                format!(
                    "relationship '{}' must be either owning (join column/table) or mapped_by",
                    relation.name
                ),
            ));
        }

        match relation.kind {
            RelationshipKind::ManyToOne if !owning => {
                return Err(Error::mapping(
                    owner.name,
                    format!("many-to-one '{}' must own its join column", relation.name),
                ));
            }
            RelationshipKind::OneToMany if owning => {
                return Err(Error::mapping(
                    owner.name,
                    format!("one-to-many '{}' must be mapped_by", relation.name),
                ));
            }
            RelationshipKind::ManyToMany if owning && relation.join_table.is_none() => {
                return Err(Error::mapping(
                    owner.name,
                    format!("many-to-many '{}' needs a join table", relation.name),
                ));
            }
            RelationshipKind::ManyToOne | RelationshipKind::OneToOne
                if relation.join_table.is_some() =>
            {
                return Err(Error::mapping(
                    owner.name,
                    format!("to-one '{}' cannot use a join table", relation.name),
                ));
            }
            _ => {}
        }

        if let Some(mapped_by) = relation.mapped_by {
            let Some(back) = target.relationship(mapped_by) else {
                return Err(Error::mapping(
                    owner.name,
                    format!(
                        "'{}' is mapped by '{}.{}', which does not exist",
                        relation.name, target.name, mapped_by
                    ),
                ));
            };
            let expected_kind = match relation.kind {
                RelationshipKind::OneToMany => RelationshipKind::ManyToOne,
                RelationshipKind::ManyToOne => RelationshipKind::OneToMany,
                other => other,
            };
            if !back.is_owning() || back.kind != expected_kind || back.target != owner.name {
                return Err(Error::mapping(
                    owner.name,
                    format!(
                        "'{}' is mapped by '{}.{}', which is not the matching owning side",
                        relation.name, target.name, mapped_by
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn validate_columns(descriptor: &'static EntityDescriptor) -> Result<()> {
    let mut seen = HashSet::new();
    for column in descriptor.base_columns() {
        if !seen.insert(column) {
            return Err(Error::mapping(
                descriptor.name,
                format!("column '{}' is mapped twice", column),
            ));
        }
    }

    let versions = descriptor.fields.iter().filter(|f| f.version).count();
    if versions > 1 {
        return Err(Error::mapping(
            descriptor.name,
            "at most one version field is allowed",
        ));
    }

    if let Some(inheritance) = &descriptor.inheritance {
        let mut discriminators = HashSet::new();
        let mut tables = HashSet::new();
        for subtype in inheritance.subtypes {
            if !discriminators.insert(subtype.discriminator_value) {
                return Err(Error::mapping(
                    descriptor.name,
                    format!(
                        "discriminator value '{}' is used twice",
                        subtype.discriminator_value
                    ),
                ));
            }
            if inheritance.is_joined() {
                if subtype.table == descriptor.table || !tables.insert(subtype.table) {
                    return Err(Error::mapping(
                        descriptor.name,
                        format!("subtype table '{}' is not unique", subtype.table),
                    ));
                }
                let mut own = HashSet::new();
                for field in subtype.fields {
                    if field.column == descriptor.id.column || !own.insert(field.column) {
                        return Err(Error::mapping(
                            descriptor.name,
                            format!(
                                "column '{}' is mapped twice in subtype {}",
                                field.column, subtype.name
                            ),
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}
