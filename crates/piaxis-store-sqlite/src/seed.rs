use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedSummary {
    pub users_inserted: usize,
    pub details_inserted: usize,
    pub rules_inserted: usize,
}

const USERS: &[(i64, &str, &str)] = &[
    (1, "admin@example.com", "admin"),
    (2, "alice@example.com", "architect"),
    (3, "bob@example.com", "architect"),
    (4, "carol@example.com", "architect"),
];

// (id, title, category, tags, description, source, owner)
type DetailRow = (i64, &'static str, &'static str, &'static str, &'static str, &'static str, Option<i64>);

const DETAILS: &[DetailRow] = &[
    (
        1,
        "Slab Edge Insulation",
        "Foundations",
        "slab, insulation, thermal bridge",
        "Continuous insulation wrapping the slab edge below the wall line.",
        "standard",
        None,
    ),
    (
        2,
        "Parapet Flashing",
        "Roofing",
        "parapet, flashing, membrane",
        "Membrane upturn and metal coping at a low parapet.",
        "standard",
        None,
    ),
    (
        3,
        "Window Sill Drainage",
        "Openings",
        "window, sill, drainage",
        "Sloped sill pan with end dams draining to the wall face.",
        "standard",
        None,
    ),
    (
        4,
        "Balcony Slab Thermal Break",
        "Structure",
        "balcony, slab, thermal break",
        "Load-bearing thermal break between the floor slab and cantilevered balcony.",
        "standard",
        None,
    ),
    (
        5,
        "Curtain Wall Fire Stop",
        "Envelope",
        "curtain wall, fire stop, perimeter",
        "Mineral wool safing at the curtain wall to slab perimeter joint.",
        "standard",
        None,
    ),
    (
        6,
        "Riverside Loft Roof Terrace",
        "Roofing",
        "terrace, pedestal, membrane",
        "Pedestal paver terrace over inverted roof insulation.",
        "user_project",
        Some(2),
    ),
    (
        7,
        "Harbour Pavilion Canopy",
        "Envelope",
        "canopy, steel, drainage",
        "Cantilevered steel canopy with concealed gutter.",
        "user_project",
        Some(4),
    ),
];

// (id, detail_id, host_element, adjacent_element, exposure)
const RULES: &[(i64, i64, &str, &str, &str)] = &[
    (1, 1, "Wall", "Slab", "Exterior"),
    (2, 2, "Roof", "Parapet", "Exterior"),
    (3, 3, "Window", "Wall", "Exterior"),
    (4, 4, "Balcony", "Slab", "Exterior"),
    (5, 5, "Curtain Wall", "Slab", "Interior"),
];

pub(crate) fn apply(conn: &Connection) -> Result<SeedSummary> {
    let mut summary = SeedSummary::default();

    for (id, email, role) in USERS {
        summary.users_inserted += conn
            .execute(
                "INSERT OR IGNORE INTO users(id, email, role) VALUES (?1, ?2, ?3)",
                params![id, email, role],
            )
            .with_context(|| format!("failed to seed user {email}"))?;
    }

    for (id, title, category, tags, description, source, owner) in DETAILS {
        summary.details_inserted += conn
            .execute(
                "INSERT OR IGNORE INTO details(id, title, category, tags, description, source, user_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![id, title, category, tags, description, source, owner],
            )
            .with_context(|| format!("failed to seed detail {id}"))?;
    }

    for (id, detail_id, host, adjacent, exposure) in RULES {
        summary.rules_inserted += conn
            .execute(
                "INSERT OR IGNORE INTO detail_usage_rules(id, detail_id, host_element, adjacent_element, exposure)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, detail_id, host, adjacent, exposure],
            )
            .with_context(|| format!("failed to seed usage rule {id}"))?;
    }

    Ok(summary)
}
