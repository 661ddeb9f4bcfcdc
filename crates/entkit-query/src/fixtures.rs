//! Test entities shared by the query crate's unit tests.

use entkit_core::{Collection, Metamodel, Ref};
use entkit_macros::Entity;

#[derive(Debug, Entity)]
pub(crate) struct Team {
    #[entity(id, generated, column = "team_id")]
    pub id: Option<i64>,
    pub name: String,
    #[entity(one_to_many(mapped_by = "team"))]
    pub members: Collection<Member>,
}

#[derive(Debug, Entity)]
pub(crate) struct Member {
    #[entity(id, generated, column = "member_id")]
    pub id: Option<i64>,
    #[entity(column = "username")]
    pub name: String,
    pub age: i32,
    pub team: Ref<Team>,
}

pub(crate) fn model() -> Metamodel {
    Metamodel::builder()
        .register::<Team>()
        .register::<Member>()
        .build()
        .expect("test metamodel is valid")
}
