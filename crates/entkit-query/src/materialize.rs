//! Turning result rows into tuples of managed instances.
//!
//! Rows are read segment by segment. Each entity slice goes through a
//! [`Hydrator`], which is where a persistence context consults its identity
//! map, so the same key read twice (or from two rows of a fetch join) comes
//! back as the same instance.

use crate::compile::{CompiledQuery, Output};
use crate::layout::EntityRow;
use entkit_core::{
    Entity, EntityDescriptor, EntityObject, Error, FromValue, Managed, ObjectId, RelationValue,
    RelationshipInfo, Result, Row, TypeError, Value,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// What hydrating one entity slice produced.
pub enum Hydrated {
    Instance(Arc<dyn EntityObject>),
    /// The key belongs to an instance that must not be returned (for
    /// example one scheduled for removal).
    Excluded,
}

/// Resolves entity slices to instances and attaches fetched relations.
pub trait Hydrator {
    fn hydrate(
        &mut self,
        descriptor: &'static EntityDescriptor,
        row: &EntityRow,
    ) -> Result<Hydrated>;

    /// Populate `relation` on `owner` from a fetch join.
    fn attach(
        &mut self,
        owner: &Arc<dyn EntityObject>,
        relation: &'static RelationshipInfo,
        value: RelationValue,
    ) -> Result<()>;
}

/// One position of a result tuple.
#[derive(Clone)]
pub enum TupleItem {
    Value(Value),
    /// An entity; `None` for an unmatched left join
    Entity(Option<Arc<dyn EntityObject>>),
}

impl std::fmt::Debug for TupleItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TupleItem::Value(value) => f.debug_tuple("Value").field(value).finish(),
            TupleItem::Entity(Some(object)) => f
                .debug_tuple("Entity")
                .field(&object.descriptor().name)
                .field(&object.entity_id())
                .finish(),
            TupleItem::Entity(None) => f.write_str("Entity(None)"),
        }
    }
}

/// One result row, in projection order.
#[derive(Debug, Clone)]
pub struct Tuple {
    items: Vec<TupleItem>,
}

fn position_error(index: usize, expected: &'static str, actual: impl Into<String>) -> Error {
    Error::Type(TypeError {
        expected,
        actual: actual.into(),
        column: Some(format!("#{}", index)),
    })
}

impl Tuple {
    pub fn new(items: Vec<TupleItem>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TupleItem> {
        self.items.get(index)
    }

    /// The scalar at `index`, if that position holds one.
    pub fn value(&self, index: usize) -> Option<&Value> {
        match self.items.get(index) {
            Some(TupleItem::Value(value)) => Some(value),
            _ => None,
        }
    }

    /// Convert the scalar at `index`.
    pub fn get_as<T: FromValue>(&self, index: usize) -> Result<T> {
        match self.items.get(index) {
            Some(TupleItem::Value(value)) => T::from_value(value),
            Some(TupleItem::Entity(_)) => Err(position_error(
                index,
                std::any::type_name::<T>(),
                "an entity",
            )),
            None => Err(position_error(
                index,
                std::any::type_name::<T>(),
                format!("tuple has {} items", self.items.len()),
            )),
        }
    }

    /// The entity at `index`; `None` for an unmatched left join.
    pub fn entity<E: Entity>(&self, index: usize) -> Result<Option<Managed<E>>> {
        match self.items.get(index) {
            Some(TupleItem::Entity(Some(object))) => {
                Managed::from_erased(Arc::clone(object)).map(Some)
            }
            Some(TupleItem::Entity(None)) => Ok(None),
            Some(TupleItem::Value(value)) => Err(position_error(
                index,
                E::descriptor().name,
                value.type_name(),
            )),
            None => Err(position_error(
                index,
                E::descriptor().name,
                format!("tuple has {} items", self.items.len()),
            )),
        }
    }

    /// The entity at `index`, which must be present.
    pub fn required_entity<E: Entity>(&self, index: usize) -> Result<Managed<E>> {
        self.entity(index)?
            .ok_or_else(|| position_error(index, E::descriptor().name, "NULL"))
    }

    pub fn into_items(self) -> Vec<TupleItem> {
        self.items
    }

    fn identity(&self) -> Vec<Option<ObjectId>> {
        self.items
            .iter()
            .filter_map(|item| match item {
                TupleItem::Entity(object) => Some(object.as_ref().map(ObjectId::of)),
                TupleItem::Value(_) => None,
            })
            .collect()
    }
}

/// Types built from a result tuple, for DTO-style projections.
pub trait FromTuple: Sized {
    fn from_tuple(tuple: Tuple) -> Result<Self>;
}

impl FromTuple for Tuple {
    fn from_tuple(tuple: Tuple) -> Result<Self> {
        Ok(tuple)
    }
}

enum Slot {
    /// NULL key (unmatched left join)
    Absent,
    Excluded,
    Present(Arc<dyn EntityObject>),
}

struct Gathered {
    owner: Arc<dyn EntityObject>,
    relation: &'static RelationshipInfo,
    targets: Vec<Arc<dyn EntityObject>>,
    seen: HashSet<ObjectId>,
}

/// Build tuples from rows, attaching fetch-joined relations.
pub fn materialize<H: Hydrator>(
    compiled: &CompiledQuery,
    rows: &[Row],
    hydrator: &mut H,
) -> Result<Vec<Tuple>> {
    let mut tuples = Vec::with_capacity(rows.len());
    // (owner, relation) -> index into `gathered`
    let mut index: HashMap<(ObjectId, &'static str), usize> = HashMap::new();
    let mut gathered: Vec<Gathered> = Vec::new();

    for row in rows {
        let mut slots = Vec::with_capacity(compiled.segments.len());
        for segment in &compiled.segments {
            let slot = match segment.layout.read(row, segment.start)? {
                None => Slot::Absent,
                Some(entity_row) => match hydrator.hydrate(segment.layout.descriptor(), &entity_row)? {
                    Hydrated::Instance(object) => Slot::Present(object),
                    Hydrated::Excluded => Slot::Excluded,
                },
            };
            slots.push(slot);
        }

        let excluded = compiled.outputs.iter().any(|output| {
            matches!(output, Output::Entity(i) if matches!(slots.get(*i), Some(Slot::Excluded)))
        });
        if excluded {
            continue;
        }

        for fetch in &compiled.fetches {
            let Some(Slot::Present(owner)) = slots.get(fetch.owner) else {
                continue;
            };
            let key = (ObjectId::of(owner), fetch.relation.name);
            let entry = *index.entry(key).or_insert_with(|| {
                gathered.push(Gathered {
                    owner: Arc::clone(owner),
                    relation: fetch.relation,
                    targets: Vec::new(),
                    seen: HashSet::new(),
                });
                gathered.len() - 1
            });
            if let Some(Slot::Present(target)) = slots.get(fetch.target) {
                let group = &mut gathered[entry];
                if group.seen.insert(ObjectId::of(target)) {
                    group.targets.push(Arc::clone(target));
                }
            }
        }

        let items = compiled
            .outputs
            .iter()
            .map(|output| match output {
                Output::Entity(i) => TupleItem::Entity(match slots.get(*i) {
                    Some(Slot::Present(object)) => Some(Arc::clone(object)),
                    _ => None,
                }),
                Output::Value(column) => {
                    TupleItem::Value(row.get(*column).cloned().unwrap_or(Value::Null))
                }
            })
            .collect();
        tuples.push(Tuple::new(items));
    }

    for group in gathered {
        let value = if group.relation.kind.is_singular() {
            RelationValue::One(group.targets.into_iter().next())
        } else {
            RelationValue::Many(group.targets)
        };
        hydrator.attach(&group.owner, group.relation, value)?;
    }

    if compiled.collapse {
        let mut seen = HashSet::new();
        tuples.retain(|tuple| seen.insert(tuple.identity()));
    }

    if let Some(page) = compiled.in_memory_page {
        let offset = usize::try_from(page.offset).unwrap_or(usize::MAX);
        let limit = page
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        tuples = tuples.into_iter().skip(offset).take(limit).collect();
    }

    Ok(tuples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{Member, Team, model};
    use crate::path::EntityPath;
    use crate::select::{Projection, select, select_from};
    use entkit_core::{HydrateScope, Loadable};

    /// Minimal identity map keyed by entity name and rendered key.
    #[derive(Default)]
    struct MapHydrator {
        instances: HashMap<(&'static str, String), Arc<dyn EntityObject>>,
        excluded: HashSet<String>,
        attached: usize,
    }

    impl Hydrator for MapHydrator {
        fn hydrate(
            &mut self,
            descriptor: &'static EntityDescriptor,
            row: &EntityRow,
        ) -> Result<Hydrated> {
            let key = row.key.to_string();
            if self.excluded.contains(&key) {
                return Ok(Hydrated::Excluded);
            }
            if let Some(existing) = self.instances.get(&(descriptor.name, key.clone())) {
                return Ok(Hydrated::Instance(Arc::clone(existing)));
            }
            let scope = HydrateScope::detached(descriptor);
            let object = (descriptor.factory)(&row.row, &scope)?;
            self.instances
                .insert((descriptor.name, key), Arc::clone(&object));
            Ok(Hydrated::Instance(object))
        }

        fn attach(
            &mut self,
            owner: &Arc<dyn EntityObject>,
            relation: &'static RelationshipInfo,
            value: RelationValue,
        ) -> Result<()> {
            self.attached += 1;
            owner.attach(relation.name, value)
        }
    }

    fn team_member_row(labels: &[String], team: (i64, &str), member: (i64, &str, i32)) -> Row {
        Row::new(
            labels.to_vec(),
            vec![
                Value::BigInt(team.0),
                Value::Text(team.1.into()),
                Value::BigInt(member.0),
                Value::Text(member.1.into()),
                Value::Int(member.2),
                Value::BigInt(team.0),
            ],
        )
    }

    #[test]
    fn test_collection_fetch_collapses_and_attaches() {
        let t = EntityPath::<Team>::new("t");
        let m = EntityPath::<Member>::new("m");
        let compiled = select_from(&t)
            .fetch_join(&t, "members", &m)
            .compile(&model())
            .unwrap();
        let labels = compiled.plan.labels();
        let rows = vec![
            team_member_row(&labels, (1, "A"), (10, "member1", 10)),
            team_member_row(&labels, (1, "A"), (11, "member2", 20)),
            team_member_row(&labels, (2, "B"), (12, "member3", 30)),
        ];
        let mut hydrator = MapHydrator::default();
        let tuples = materialize(&compiled, &rows, &mut hydrator).unwrap();

        assert_eq!(tuples.len(), 2);
        assert_eq!(hydrator.attached, 2);
        let team_a: Managed<Team> = tuples[0].required_entity(0).unwrap();
        assert!(team_a.read().members.is_loaded());
        assert_eq!(team_a.read().members.len(), Some(2));
    }

    #[test]
    fn test_in_memory_page_applies_after_collapse() {
        let t = EntityPath::<Team>::new("t");
        let m = EntityPath::<Member>::new("m");
        let compiled = select_from(&t)
            .fetch_join(&t, "members", &m)
            .order_by(t.get("name").asc())
            .offset(1)
            .limit(1)
            .compile(&model())
            .unwrap();
        let labels = compiled.plan.labels();
        let rows = vec![
            team_member_row(&labels, (1, "A"), (10, "member1", 10)),
            team_member_row(&labels, (1, "A"), (11, "member2", 20)),
            team_member_row(&labels, (2, "B"), (12, "member3", 30)),
        ];
        let tuples = materialize(&compiled, &rows, &mut MapHydrator::default()).unwrap();
        assert_eq!(tuples.len(), 1);
        let team: Managed<Team> = tuples[0].required_entity(0).unwrap();
        assert_eq!(team.read().name, "B");
    }

    #[test]
    fn test_excluded_entities_drop_their_rows() {
        let m = EntityPath::<Member>::new("m");
        let compiled = select_from(&m).compile(&model()).unwrap();
        let labels = compiled.plan.labels();
        let row = |id: i64| {
            Row::new(
                labels.clone(),
                vec![
                    Value::BigInt(id),
                    Value::Text(format!("member{id}")),
                    Value::Int(10),
                    Value::Null,
                ],
            )
        };
        let mut hydrator = MapHydrator::default();
        hydrator.excluded.insert("2".to_string());
        let tuples = materialize(&compiled, &[row(1), row(2)], &mut hydrator).unwrap();
        assert_eq!(tuples.len(), 1);
    }

    #[test]
    fn test_same_key_is_same_instance_across_rows() {
        let m = EntityPath::<Member>::new("m");
        let t = EntityPath::<Team>::new("t");
        let compiled = select(vec![Projection::entity(&m), Projection::entity(&t)])
            .from(&m)
            .join(&m, "team", &t)
            .compile(&model())
            .unwrap();
        let labels = compiled.plan.labels();
        let rows: Vec<Row> = [(10, "member1"), (11, "member2")]
            .into_iter()
            .map(|(id, name)| {
                Row::new(
                    labels.clone(),
                    vec![
                        Value::BigInt(id),
                        Value::Text(name.into()),
                        Value::Int(10),
                        Value::BigInt(1),
                        Value::BigInt(1),
                        Value::Text("A".into()),
                    ],
                )
            })
            .collect();
        let tuples = materialize(&compiled, &rows, &mut MapHydrator::default()).unwrap();
        let first: Managed<Team> = tuples[0].required_entity(1).unwrap();
        let second: Managed<Team> = tuples[1].required_entity(1).unwrap();
        assert!(first.ptr_eq(&second));
        assert!(tuples[0].get_as::<i64>(1).is_err());
    }
}
