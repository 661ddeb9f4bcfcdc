//! Domain model shared by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use asupersync::runtime::RuntimeBuilder;
use entkit::{
    Collection, Embeddable, Entity, Error, Managed, MemoryExecutor, Metamodel, Outcome,
    PersistenceContext, Ref,
};

pub type Db = Arc<MemoryExecutor>;
pub type Ctx = PersistenceContext<Db>;

// ============================================================================
// Harness
// ============================================================================

pub fn run<F: Future>(future: F) -> F::Output {
    RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime")
        .block_on(future)
}

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

pub fn unwrap_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => std::panic::panic_any(format!("expected an error, got {other:?}")),
    }
}

pub fn model() -> Metamodel {
    Metamodel::builder()
        .register::<Team>()
        .register::<Member>()
        .register::<Project>()
        .register::<Vehicle>()
        .register::<Payment>()
        .build()
        .expect("fixture metamodel is valid")
}

/// A fresh store plus a context over it.
pub fn setup() -> (Db, Ctx) {
    let model = model();
    let db = Arc::new(MemoryExecutor::with_schema(&model));
    let ctx = PersistenceContext::new(Arc::clone(&db), model);
    (db, ctx)
}

/// A second context sharing `db`.
pub fn open(db: &Db) -> Ctx {
    PersistenceContext::new(Arc::clone(db), model())
}

pub fn team(name: &str) -> Managed<Team> {
    Managed::new(Team::new(name))
}

/// A member wired to `team` on both sides.
pub fn join_team(team: &Managed<Team>, name: &str, age: i32) -> Managed<Member> {
    let mut member = Member::new(name, age);
    member.team = Ref::from(team);
    let member = Managed::new(member);
    team.write()
        .members
        .push(member.clone())
        .expect("members collection is initialized");
    member
}

// ============================================================================
// Team / Member / Project
// ============================================================================

#[derive(Debug, Entity)]
pub struct Team {
    #[entity(id, generated, column = "team_id")]
    pub id: Option<i64>,
    pub name: String,
    #[entity(version)]
    pub version: i64,
    #[entity(one_to_many(mapped_by = "team", cascade = "all"))]
    pub members: Collection<Member>,
}

#[derive(Debug, Clone, PartialEq, Embeddable)]
pub struct Address {
    pub city: String,
    pub street: String,
}

#[derive(Debug, Entity)]
pub struct Member {
    #[entity(id, generated, column = "member_id")]
    pub id: Option<i64>,
    #[entity(column = "username")]
    pub name: Option<String>,
    pub age: Option<i32>,
    #[entity(embedded)]
    pub address: Option<Address>,
    pub team: Ref<Team>,
    #[entity(collection(table = "member_nickname", owner_column = "member_id", column = "nickname"))]
    pub nicknames: Vec<String>,
    #[entity(many_to_many(
        join_table = "member_project",
        owner_column = "member_id",
        target_column = "project_code",
        cascade = "persist"
    ))]
    pub projects: Collection<Project>,
}

#[derive(Debug, Entity)]
pub struct Project {
    #[entity(id, column = "project_code")]
    pub code: i64,
    pub title: String,
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
}

impl Member {
    pub fn new(name: &str, age: i32) -> Self {
        Member {
            id: None,
            name: Some(name.to_string()),
            age: Some(age),
            address: None,
            team: Ref::Null,
            nicknames: Vec::new(),
            projects: Collection::new(),
        }
    }
}

impl Project {
    pub fn new(code: i64, title: &str) -> Self {
        Project {
            code,
            title: title.to_string(),
        }
    }
}

impl Address {
    pub fn new(city: &str, street: &str) -> Self {
        Address {
            city: city.to_string(),
            street: street.to_string(),
        }
    }
}

// ============================================================================
// Hierarchies
// ============================================================================

/// Stored in one `vehicle` table with a `DTYPE` discriminator.
#[derive(Debug, Entity)]
#[entity(inheritance = "single_table")]
pub enum Vehicle {
    #[entity(discriminator = "CAR")]
    Car {
        #[entity(id, generated, column = "vehicle_id")]
        id: Option<i64>,
        plate: String,
        seats: i32,
    },
    #[entity(discriminator = "TRUCK")]
    Truck {
        #[entity(id, generated, column = "vehicle_id")]
        id: Option<i64>,
        plate: String,
        payload: i64,
    },
}

/// Stored in `payment` plus one table per subtype.
#[derive(Debug, Entity)]
#[entity(inheritance = "joined", discriminator = "kind")]
pub enum Payment {
    #[entity(discriminator = "card", table = "card_payment")]
    Card {
        #[entity(id, generated, column = "payment_id")]
        id: Option<i64>,
        amount: i64,
        #[entity(column = "card_number")]
        number: String,
    },
    #[entity(discriminator = "transfer", table = "transfer_payment")]
    Transfer {
        #[entity(id, generated, column = "payment_id")]
        id: Option<i64>,
        amount: i64,
        iban: String,
    },
}

impl Vehicle {
    pub fn car(plate: &str, seats: i32) -> Self {
        Vehicle::Car {
            id: None,
            plate: plate.to_string(),
            seats,
        }
    }

    pub fn truck(plate: &str, payload: i64) -> Self {
        Vehicle::Truck {
            id: None,
            plate: plate.to_string(),
            payload,
        }
    }

    pub fn plate(&self) -> &str {
        match self {
            Vehicle::Car { plate, .. } | Vehicle::Truck { plate, .. } => plate,
        }
    }
}

impl Payment {
    pub fn card(amount: i64, number: &str) -> Self {
        Payment::Card {
            id: None,
            amount,
            number: number.to_string(),
        }
    }

    pub fn transfer(amount: i64, iban: &str) -> Self {
        Payment::Transfer {
            id: None,
            amount,
            iban: iban.to_string(),
        }
    }
}
