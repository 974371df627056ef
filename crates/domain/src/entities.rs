//! Canonical game entities.
//!
//! The canonical form of every entity is its serde representation with
//! snake_case keys and snake_case enum values. Protocol adapters rewrite that
//! form into each server's conventions and back; these types never see a
//! server-native key.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

// ============================================================================
// Entity Kind
// ============================================================================

/// Which table schema a row belongs to.
///
/// `Generic` covers tables the client has no schema for: keys are still
/// re-cased, but nothing is injected and nothing is stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Player,
    Entity,
    Circle,
    Food,
    Config,
    Generic,
}

impl EntityKind {
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::Player => "player",
            EntityKind::Entity => "entity",
            EntityKind::Circle => "circle",
            EntityKind::Food => "food",
            EntityKind::Config => "config",
            EntityKind::Generic => "generic",
        }
    }

    /// Resolve a server table name regardless of its casing convention
    /// (`players`, `Player`, `world_config`, `WorldConfig` ...).
    pub fn from_table_name(name: &str) -> Self {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "player" | "players" => EntityKind::Player,
            "entity" | "entities" | "gameentity" | "gameentities" => EntityKind::Entity,
            "circle" | "circles" => EntityKind::Circle,
            "food" | "foods" => EntityKind::Food,
            "config" | "configs" | "worldconfig" => EntityKind::Config,
            _ => EntityKind::Generic,
        }
    }

    /// Canonical key identifying a row within its table
    pub fn primary_key(&self) -> Option<&'static str> {
        match self {
            EntityKind::Player => Some("identity"),
            EntityKind::Entity | EntityKind::Circle | EntityKind::Food => Some("entity_id"),
            EntityKind::Config => Some("id"),
            EntityKind::Generic => None,
        }
    }

    /// Canonical field names declared by this kind's schema.
    pub fn canonical_fields(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Player => &["identity", "player_id", "name", "status"],
            EntityKind::Entity => &["entity_id", "position", "mass"],
            EntityKind::Circle => &[
                "entity_id",
                "player_id",
                "direction",
                "speed",
                "last_split_time",
            ],
            EntityKind::Food => &["entity_id"],
            EntityKind::Config => &["id", "world_size"],
            EntityKind::Generic => &[],
        }
    }

    /// Fields holding enum values whose casing follows the server language
    pub fn enum_fields(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Player => &["status"],
            _ => &[],
        }
    }

    /// Whether servers expect a creation timestamp on rows of this kind
    pub fn requires_created_at(&self) -> bool {
        !matches!(self, EntityKind::Generic)
    }

    /// Whether `field` belongs to the schema. Generic accepts everything.
    pub fn declares(&self, field: &str) -> bool {
        matches!(self, EntityKind::Generic) || self.canonical_fields().contains(&field)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// A typed entity that the pipeline can validate, adapt and serialize.
pub trait CanonicalEntity:
    Serialize + DeserializeOwned + Validate + Clone + Send + Sync + 'static
{
    const KIND: EntityKind;
}

// ============================================================================
// Value Types
// ============================================================================

fn finite(value: f32) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::new("not_finite"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, Validate)]
pub struct Vector2 {
    #[validate(custom(function = "finite"))]
    pub x: f32,
    #[validate(custom(function = "finite"))]
    pub y: f32,
}

impl Vector2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    #[default]
    Active,
    Idle,
    Spectating,
    Eliminated,
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Player {
    #[validate(length(min = 1))]
    pub identity: String,
    pub player_id: u32,
    #[validate(length(min = 1, max = 32))]
    pub name: String,
    #[serde(default)]
    pub status: PlayerStatus,
}

impl CanonicalEntity for Player {
    const KIND: EntityKind = EntityKind::Player;
}

/// Anything with a position and mass in the arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct GameEntity {
    pub entity_id: u32,
    #[validate(nested)]
    pub position: Vector2,
    #[validate(range(min = 1))]
    pub mass: u32,
}

impl CanonicalEntity for GameEntity {
    const KIND: EntityKind = EntityKind::Entity;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Circle {
    pub entity_id: u32,
    pub player_id: u32,
    #[validate(nested)]
    pub direction: Vector2,
    #[validate(range(min = 0.0, max = 1000.0))]
    pub speed: f32,
    /// Unix millis of the last split, 0 if never
    pub last_split_time: i64,
}

impl CanonicalEntity for Circle {
    const KIND: EntityKind = EntityKind::Circle;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Food {
    pub entity_id: u32,
}

impl CanonicalEntity for Food {
    const KIND: EntityKind = EntityKind::Food;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct WorldConfig {
    pub id: u32,
    #[validate(range(min = 1))]
    pub world_size: u64,
}

impl CanonicalEntity for WorldConfig {
    const KIND: EntityKind = EntityKind::Config;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_resolve_across_conventions() {
        assert_eq!(EntityKind::from_table_name("players"), EntityKind::Player);
        assert_eq!(EntityKind::from_table_name("Player"), EntityKind::Player);
        assert_eq!(EntityKind::from_table_name("entities"), EntityKind::Entity);
        assert_eq!(EntityKind::from_table_name("WorldConfig"), EntityKind::Config);
        assert_eq!(EntityKind::from_table_name("leaderboard"), EntityKind::Generic);
    }

    #[test]
    fn canonical_fields_match_serde_keys() {
        let player = Player {
            identity: "abc".into(),
            player_id: 1,
            name: "zed".into(),
            status: PlayerStatus::Spectating,
        };
        let value = serde_json::to_value(&player).unwrap();
        let keys: Vec<&str> = value
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();

        for field in EntityKind::Player.canonical_fields() {
            assert!(keys.contains(field), "missing {field}");
        }
        assert_eq!(value["status"], "spectating");
    }

    #[test]
    fn validation_rejects_bad_rows() {
        let player = Player {
            identity: "abc".into(),
            player_id: 1,
            name: String::new(),
            status: PlayerStatus::Active,
        };
        assert!(player.validate().is_err());

        let entity = GameEntity {
            entity_id: 7,
            position: Vector2::new(f32::NAN, 0.0),
            mass: 10,
        };
        assert!(entity.validate().is_err());

        let circle = Circle {
            entity_id: 1,
            player_id: 1,
            direction: Vector2::new(1.0, 0.0),
            speed: 12.5,
            last_split_time: 0,
        };
        assert!(circle.validate().is_ok());
    }

    #[test]
    fn vector_components_must_be_finite() {
        assert!(Vector2::new(0.5, -3.0).validate().is_ok());

        let errors = Vector2::new(0.0, f32::INFINITY).validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(!fields.contains_key("x"));
        assert_eq!(fields["y"][0].code, "not_finite");
    }

    #[test]
    fn generic_declares_every_field() {
        assert!(EntityKind::Generic.declares("anything"));
        assert!(!EntityKind::Food.declares("created_at"));
        assert!(!EntityKind::Generic.requires_created_at());
    }
}
