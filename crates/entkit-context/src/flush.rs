//! Flush planning and statement construction.
//!
//! The context decides *what* to write; this module decides the order and
//! shapes the statements:
//!
//! - INSERT parents first. Edges are owning to-one FKs between instances
//!   inserted in the same flush; ties keep persist order.
//! - UPDATE in persist order, carrying every updatable column of a changed
//!   table.
//! - DELETE FK holders before the rows they reference, auxiliary rows
//!   (element collections, link rows, joined subtype rows) before the owner
//!   row.
//!
//! When only cycles remain, a nullable edge of the cycle is broken: for
//! inserts the holder is written with a NULL FK and the update phase fills
//! it in; for deletes the FK is cleared before the deletes run. A cycle made
//! only of mandatory edges cannot be inserted and fails with
//! `UnresolvableInsertOrder`.

use crate::inheritance::{TableImage, column_access};
use entkit_core::{
    EntityDescriptor, Error, InsertOrderError, ObjectId, RelationshipInfo, Result, Value,
    ValueCollectionInfo,
};
use entkit_query::{DeleteStatement, Expr, InsertStatement, Statement, UpdateStatement};
use std::collections::HashSet;

/// Counts of what a flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Instances inserted
    pub inserted: usize,
    /// Instances updated
    pub updated: usize,
    /// Instances deleted
    pub deleted: usize,
    /// Statements executed, auxiliary rows included
    pub statements: usize,
}

impl FlushResult {
    pub fn is_empty(&self) -> bool {
        self.statements == 0
    }
}

/// "`before` must be written before the node holding this edge."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub before: ObjectId,
    /// Instance whose FK column forms the edge
    pub holder: ObjectId,
    pub relation: &'static str,
    pub nullable: bool,
}

/// One instance to order.
#[derive(Debug, Clone)]
pub struct PlanNode {
    pub id: ObjectId,
    pub entity: &'static str,
    pub edges: Vec<Edge>,
}

/// What to do with a cycle that has no nullable edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MandatoryCycle {
    Fail,
    /// Drop the first edge anyway; the executor's constraints decide.
    Ignore,
}

/// A write order plus the edges broken to obtain it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOrder {
    pub order: Vec<ObjectId>,
    /// `(holder, relation)` pairs whose FK must be written separately
    pub broken: Vec<(ObjectId, &'static str)>,
}

impl WriteOrder {
    /// Relations of `holder` whose FK is written separately.
    pub fn broken_for(&self, holder: ObjectId) -> Vec<&'static str> {
        self.broken
            .iter()
            .filter(|(id, _)| *id == holder)
            .map(|(_, relation)| *relation)
            .collect()
    }
}

/// `(before, holder, relation)` of broken edges
type BrokenSet = HashSet<(ObjectId, ObjectId, &'static str)>;

/// Topologically order `nodes`, given in persist order.
///
/// A node is ready when every edge it holds is either broken or points at
/// a node already placed. Among ready nodes the earliest wins.
pub fn order_nodes(nodes: &[PlanNode], on_mandatory: MandatoryCycle) -> Result<WriteOrder> {
    let ids: HashSet<ObjectId> = nodes.iter().map(|n| n.id).collect();
    let mut placed: HashSet<ObjectId> = HashSet::new();
    let mut broken: BrokenSet = HashSet::new();
    let mut result = WriteOrder::default();

    let blocked = |edge: &Edge, placed: &HashSet<ObjectId>, broken: &BrokenSet| {
        ids.contains(&edge.before)
            && !placed.contains(&edge.before)
            && !broken.contains(&(edge.before, edge.holder, edge.relation))
    };

    while result.order.len() < nodes.len() {
        let ready = nodes.iter().find(|node| {
            !placed.contains(&node.id) && !node.edges.iter().any(|e| blocked(e, &placed, &broken))
        });
        if let Some(node) = ready {
            placed.insert(node.id);
            result.order.push(node.id);
            continue;
        }

        // Walk blocking edges from the earliest pending node until a node
        // repeats; the repeated stretch is a cycle.
        let Some(start) = nodes.iter().position(|n| !placed.contains(&n.id)) else {
            break;
        };
        let mut path: Vec<(usize, Edge)> = Vec::new();
        let mut current = start;
        let cycle = loop {
            let Some(edge) = nodes[current]
                .edges
                .iter()
                .find(|e| blocked(e, &placed, &broken))
                .copied()
            else {
                break Vec::new();
            };
            path.push((current, edge));
            let Some(next) = nodes.iter().position(|n| n.id == edge.before) else {
                break Vec::new();
            };
            if let Some(begin) = path.iter().position(|(index, _)| *index == next) {
                break path.split_off(begin);
            }
            current = next;
        };
        let Some((_, first)) = cycle.first().copied() else {
            break;
        };

        let mut members: Vec<usize> = cycle.iter().map(|(index, _)| *index).collect();
        members.sort_unstable();
        let chosen = match cycle.iter().map(|(_, e)| *e).find(|e| e.nullable) {
            Some(edge) => edge,
            None if on_mandatory == MandatoryCycle::Ignore => first,
            None => {
                return Err(Error::UnresolvableInsertOrder(InsertOrderError {
                    entities: members
                        .iter()
                        .map(|index| nodes[*index].entity.to_string())
                        .collect(),
                }));
            }
        };
        tracing::debug!(
            relation = chosen.relation,
            cycle = members.len(),
            "Breaking dependency cycle"
        );
        broken.insert((chosen.before, chosen.holder, chosen.relation));
        if chosen.nullable {
            result.broken.push((chosen.holder, chosen.relation));
        }
    }
    Ok(result)
}

fn key_filter(descriptor: &EntityDescriptor, key: &Value) -> Expr {
    Expr::col(descriptor.id.column).eq(Expr::lit(key.clone()))
}

fn version_filter(column: &'static str, version: &Value) -> Expr {
    if version.is_null() {
        Expr::col(column).is_null()
    } else {
        Expr::col(column).eq(Expr::lit(version.clone()))
    }
}

/// Key plus every insertable column of `image`.
pub fn insert_statement(descriptor: &EntityDescriptor, key: &Value, image: &TableImage) -> Statement {
    let mut values = vec![(descriptor.id.column, key.clone())];
    values.extend(
        image
            .columns
            .iter()
            .filter(|(column, _)| column_access(descriptor, column).insertable)
            .cloned(),
    );
    Statement::Insert(InsertStatement {
        table: image.table,
        values,
    })
}

/// A full-image update of one table. `version` carries the version column
/// with the value the row is expected to hold and the value to write.
pub fn update_statement(
    descriptor: &EntityDescriptor,
    key: &Value,
    image: &TableImage,
    version: Option<(&'static str, &Value, &Value)>,
) -> Statement {
    let mut assignments: Vec<(&'static str, Expr)> = image
        .columns
        .iter()
        .filter(|(column, _)| column_access(descriptor, column).updatable)
        .filter(|(column, _)| version.is_none_or(|(v, _, _)| v != *column))
        .map(|(column, value)| (*column, Expr::lit(value.clone())))
        .collect();
    let mut filter = key_filter(descriptor, key);
    if let Some((column, expected, next)) = version {
        assignments.push((column, Expr::lit(next.clone())));
        filter = filter.and(version_filter(column, expected));
    }
    Statement::Update(UpdateStatement {
        table: image.table,
        alias: None,
        assignments,
        filter: Some(filter),
    })
}

/// `UPDATE table SET column = NULL WHERE id = key`.
pub fn clear_column_statement(
    descriptor: &EntityDescriptor,
    key: &Value,
    column: &'static str,
) -> Statement {
    Statement::Update(UpdateStatement {
        table: descriptor.table,
        alias: None,
        assignments: vec![(column, Expr::lit(Value::Null))],
        filter: Some(key_filter(descriptor, key)),
    })
}

/// Delete one row of `table` by key, checking the version when given.
pub fn delete_statement(
    descriptor: &EntityDescriptor,
    table: &'static str,
    key: &Value,
    version: Option<(&'static str, &Value)>,
) -> Statement {
    let mut filter = key_filter(descriptor, key);
    if let Some((column, expected)) = version {
        filter = filter.and(version_filter(column, expected));
    }
    Statement::Delete(DeleteStatement {
        table,
        alias: None,
        filter: Some(filter),
    })
}

/// Delete every element row of an owner.
pub fn delete_elements_statement(collection: &ValueCollectionInfo, owner_key: &Value) -> Statement {
    Statement::Delete(DeleteStatement {
        table: collection.table,
        alias: None,
        filter: Some(Expr::col(collection.owner_column).eq(Expr::lit(owner_key.clone()))),
    })
}

/// One element row.
pub fn insert_element_statement(
    collection: &ValueCollectionInfo,
    owner_key: &Value,
    element: &[Value],
) -> Statement {
    let mut values = vec![(collection.owner_column, owner_key.clone())];
    values.extend(collection.columns().zip(element.iter().cloned()));
    Statement::Insert(InsertStatement {
        table: collection.table,
        values,
    })
}

fn link_table(owner: &EntityDescriptor, relation: &RelationshipInfo) -> Result<entkit_core::JoinTableInfo> {
    relation.join_table.ok_or_else(|| {
        Error::mapping(
            owner.name,
            format!("relationship '{}' has no join table", relation.name),
        )
    })
}

pub fn insert_link_statement(
    owner: &EntityDescriptor,
    relation: &RelationshipInfo,
    owner_key: &Value,
    target_key: &Value,
) -> Result<Statement> {
    let link = link_table(owner, relation)?;
    Ok(Statement::Insert(InsertStatement {
        table: link.table,
        values: vec![
            (link.owner_column, owner_key.clone()),
            (link.target_column, target_key.clone()),
        ],
    }))
}

pub fn delete_link_statement(
    owner: &EntityDescriptor,
    relation: &RelationshipInfo,
    owner_key: &Value,
    target_key: &Value,
) -> Result<Statement> {
    let link = link_table(owner, relation)?;
    Ok(Statement::Delete(DeleteStatement {
        table: link.table,
        alias: None,
        filter: Some(
            Expr::col(link.owner_column)
                .eq(Expr::lit(owner_key.clone()))
                .and(Expr::col(link.target_column).eq(Expr::lit(target_key.clone()))),
        ),
    }))
}

/// Delete every link row of an owner.
pub fn clear_links_statement(
    owner: &EntityDescriptor,
    relation: &RelationshipInfo,
    owner_key: &Value,
) -> Result<Statement> {
    let link = link_table(owner, relation)?;
    Ok(Statement::Delete(DeleteStatement {
        table: link.table,
        alias: None,
        filter: Some(Expr::col(link.owner_column).eq(Expr::lit(owner_key.clone()))),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_entities::{Member, Node, Team};
    use entkit_core::{Entity, Managed};

    /// Handles are returned so their addresses stay distinct.
    fn ids(count: usize) -> (Vec<Managed<Node>>, Vec<ObjectId>) {
        let nodes: Vec<_> = (0..count).map(|i| Managed::new(Node::new(i as i64))).collect();
        let ids = nodes.iter().map(Managed::object_id).collect();
        (nodes, ids)
    }

    fn edge(before: ObjectId, holder: ObjectId, nullable: bool) -> Edge {
        Edge {
            before,
            holder,
            relation: "next",
            nullable,
        }
    }

    fn node(id: ObjectId, edges: Vec<Edge>) -> PlanNode {
        PlanNode {
            id,
            entity: "Node",
            edges,
        }
    }

    #[test]
    fn test_parents_before_children() {
        let (_nodes, id) = ids(3);
        // 0 -> 2, 1 -> 0: the order must be 2, 0, 1
        let nodes = vec![
            node(id[0], vec![edge(id[2], id[0], true)]),
            node(id[1], vec![edge(id[0], id[1], true)]),
            node(id[2], vec![]),
        ];
        let order = order_nodes(&nodes, MandatoryCycle::Fail).unwrap();
        assert_eq!(order.order, vec![id[2], id[0], id[1]]);
        assert!(order.broken.is_empty());
    }

    #[test]
    fn test_edges_to_outside_nodes_are_ignored() {
        let (_nodes, id) = ids(2);
        let nodes = vec![node(id[0], vec![edge(id[1], id[0], false)])];
        let order = order_nodes(&nodes, MandatoryCycle::Fail).unwrap();
        assert_eq!(order.order, vec![id[0]]);
    }

    #[test]
    fn test_nullable_cycle_is_broken() {
        let (_nodes, id) = ids(2);
        let nodes = vec![
            node(id[0], vec![edge(id[1], id[0], false)]),
            node(id[1], vec![edge(id[0], id[1], true)]),
        ];
        let order = order_nodes(&nodes, MandatoryCycle::Fail).unwrap();
        assert_eq!(order.order, vec![id[1], id[0]]);
        assert_eq!(order.broken_for(id[1]), vec!["next"]);
        assert!(order.broken_for(id[0]).is_empty());
    }

    #[test]
    fn test_mandatory_cycle_fails() {
        let (_nodes, id) = ids(2);
        let nodes = vec![
            node(id[0], vec![edge(id[1], id[0], false)]),
            node(id[1], vec![edge(id[0], id[1], false)]),
        ];
        let err = order_nodes(&nodes, MandatoryCycle::Fail).unwrap_err();
        match err {
            Error::UnresolvableInsertOrder(e) => assert_eq!(e.entities, vec!["Node", "Node"]),
            other => panic!("unexpected error: {other}"),
        }

        let order = order_nodes(&nodes, MandatoryCycle::Ignore).unwrap();
        assert_eq!(order.order.len(), 2);
        assert!(order.broken.is_empty());
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let (_nodes, id) = ids(1);
        let nodes = vec![node(id[0], vec![edge(id[0], id[0], true)])];
        let order = order_nodes(&nodes, MandatoryCycle::Fail).unwrap();
        assert_eq!(order.order, vec![id[0]]);
        assert_eq!(order.broken_for(id[0]), vec!["next"]);
    }

    #[test]
    fn test_update_checks_and_bumps_version() {
        let image = TableImage {
            table: "team",
            columns: vec![("name", Value::Text("red".into())), ("version", Value::BigInt(1))],
        };
        let statement = update_statement(
            Team::descriptor(),
            &Value::BigInt(7),
            &image,
            Some(("version", &Value::BigInt(1), &Value::BigInt(2))),
        );
        let Statement::Update(update) = &statement else {
            panic!("expected an update");
        };
        let columns: Vec<_> = update.assignments.iter().map(|(c, _)| *c).collect();
        assert_eq!(columns, vec!["name", "version"]);
        let filter = update.filter.as_ref().map(ToString::to_string).unwrap_or_default();
        assert!(filter.contains("team_id"));
        assert!(filter.contains("version"));
    }

    #[test]
    fn test_element_rows_carry_owner_key() {
        let tags = Member::descriptor().value_collection("tags").unwrap();
        let statement =
            insert_element_statement(tags, &Value::BigInt(3), &[Value::Text("a".into())]);
        let Statement::Insert(insert) = statement else {
            panic!("expected an insert");
        };
        assert_eq!(insert.table, "member_tag");
        assert_eq!(
            insert.values,
            vec![
                ("member_id", Value::BigInt(3)),
                ("tag", Value::Text("a".into()))
            ]
        );
    }
}
