//! Entities shared by this crate's unit tests.

use entkit_core::{Collection, Managed, Metamodel, Ref};
use entkit_macros::Entity;

#[derive(Debug, Entity)]
pub(crate) struct Team {
    #[entity(id, generated, column = "team_id")]
    pub id: Option<i64>,
    pub name: String,
    #[entity(version)]
    pub version: i64,
    #[entity(one_to_many(mapped_by = "team", cascade = "all"))]
    pub members: Collection<Member>,
}

#[derive(Debug, Entity)]
pub(crate) struct Member {
    #[entity(id, generated, column = "member_id")]
    pub id: Option<i64>,
    #[entity(column = "username")]
    pub name: String,
    pub age: i32,
    #[entity(many_to_one(cascade = "persist"))]
    pub team: Ref<Team>,
    #[entity(many_to_many(
        join_table = "member_product",
        owner_column = "member_id",
        target_column = "product_id"
    ))]
    pub products: Collection<Product>,
    #[entity(collection(table = "member_tag", owner_column = "member_id", column = "tag"))]
    pub tags: Vec<String>,
}

#[derive(Debug, Entity)]
pub(crate) struct Product {
    #[entity(id, column = "product_id")]
    pub id: i64,
    pub name: String,
}

/// Self-referencing rows: `next` is optional, `peer` is mandatory.
#[derive(Debug, Entity)]
pub(crate) struct Node {
    #[entity(id, column = "node_id")]
    pub id: i64,
    #[entity(many_to_one(cascade = "persist"))]
    pub next: Ref<Node>,
    #[entity(one_to_one(required, cascade = "persist"))]
    pub peer: Ref<Node>,
}

impl Team {
    pub fn new(name: &str) -> Self {
        Team {
            id: None,
            name: name.to_string(),
            version: 0,
            members: Collection::new(),
        }
    }

    pub fn with_id(id: i64, name: &str) -> Self {
        Team {
            id: Some(id),
            ..Team::new(name)
        }
    }
}

impl Member {
    pub fn new(name: &str, age: i32) -> Self {
        Member {
            id: None,
            name: name.to_string(),
            age,
            team: Ref::Null,
            products: Collection::new(),
            tags: Vec::new(),
        }
    }
}

impl Product {
    pub fn new(id: i64, name: &str) -> Self {
        Product {
            id,
            name: name.to_string(),
        }
    }
}

impl Node {
    pub fn new(id: i64) -> Self {
        Node {
            id,
            next: Ref::Null,
            peer: Ref::Null,
        }
    }
}

/// Single-table hierarchy.
#[derive(Debug, Entity)]
#[entity(inheritance = "single_table")]
pub(crate) enum Item {
    #[entity(discriminator = "B")]
    Book {
        #[entity(id, generated, column = "item_id")]
        id: Option<i64>,
        title: String,
        author: String,
    },
    #[entity(discriminator = "F")]
    Film {
        #[entity(id, generated, column = "item_id")]
        id: Option<i64>,
        title: String,
        minutes: i32,
    },
}

/// Joined hierarchy.
#[derive(Debug, Entity)]
#[entity(inheritance = "joined")]
pub(crate) enum Account {
    #[entity(discriminator = "C")]
    Checking {
        #[entity(id, generated, column = "account_id")]
        id: Option<i64>,
        owner: String,
        overdraft: i64,
    },
    #[entity(discriminator = "S")]
    Savings {
        #[entity(id, generated, column = "account_id")]
        id: Option<i64>,
        owner: String,
        rate: f64,
    },
}

pub(crate) fn model() -> Metamodel {
    Metamodel::builder()
        .register::<Team>()
        .register::<Member>()
        .register::<Product>()
        .register::<Node>()
        .register::<Item>()
        .register::<Account>()
        .build()
        .expect("test metamodel is valid")
}

/// A member already placed on `team`.
pub(crate) fn member_of(team: &Managed<Team>, name: &str, age: i32) -> Managed<Member> {
    let mut member = Member::new(name, age);
    member.team = Ref::from(team);
    Managed::new(member)
}
