//! Dream artifact data model for the Dreamscape Gateway

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of structures per artifact
pub const MAX_STRUCTURES: usize = 20;
/// Maximum number of entity groups per artifact
pub const MAX_ENTITIES: usize = 10;
/// Maximum sum of entity counts per artifact
pub const MAX_TOTAL_ENTITY_COUNT: u32 = 500;
/// Maximum number of cinematography shots
pub const MAX_SHOTS: usize = 10;
/// Allowed deviation between shot durations and total duration, seconds
pub const SHOT_SUM_TOLERANCE: f64 = 2.0;
/// Maximum magnitude of a structure position coordinate
pub const MAX_POSITION_MAGNITUDE: f64 = 1000.0;

/// Visual style of a dream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DreamStyle {
    Ethereal,
    Cyberpunk,
    Surreal,
    Fantasy,
    Nightmare,
}

impl Default for DreamStyle {
    fn default() -> Self {
        DreamStyle::Ethereal
    }
}

impl fmt::Display for DreamStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DreamStyle::Ethereal => "ethereal",
            DreamStyle::Cyberpunk => "cyberpunk",
            DreamStyle::Surreal => "surreal",
            DreamStyle::Fantasy => "fantasy",
            DreamStyle::Nightmare => "nightmare",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for DreamStyle {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ethereal" => Ok(DreamStyle::Ethereal),
            "cyberpunk" => Ok(DreamStyle::Cyberpunk),
            "surreal" => Ok(DreamStyle::Surreal),
            "fantasy" => Ok(DreamStyle::Fantasy),
            "nightmare" => Ok(DreamStyle::Nightmare),
            _ => Err(()),
        }
    }
}

/// Requested output quality, drives prompt directives and cache TTL tier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RequestQuality {
    Draft,
    Medium,
    High,
    Cinematic,
}

impl Default for RequestQuality {
    fn default() -> Self {
        RequestQuality::Medium
    }
}

impl fmt::Display for RequestQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestQuality::Draft => "draft",
            RequestQuality::Medium => "medium",
            RequestQuality::High => "high",
            RequestQuality::Cinematic => "cinematic",
        };
        f.write_str(s)
    }
}

/// Requested scene complexity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RequestComplexity {
    Simple,
    Moderate,
    Complex,
}

impl Default for RequestComplexity {
    fn default() -> Self {
        RequestComplexity::Moderate
    }
}

/// Options accepted on the northbound generate call
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerateOptions {
    pub quality: RequestQuality,
    pub complexity: RequestComplexity,
    /// Requested clip duration in seconds, 10..=300
    pub duration: Option<f64>,
    pub seed: Option<u64>,
    pub provider_hint: Option<String>,
}

/// Environment preset enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentPreset {
    Dawn,
    Dusk,
    Night,
    Void,
    Underwater,
}

/// Scene environment description
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub preset: EnvironmentPreset,
    /// Fog density, 0..=1
    pub fog: f64,
    /// Hex color, "#rrggbb"
    pub sky_color: String,
    /// Ambient light intensity, 0..=3
    pub ambient_light: f64,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            preset: EnvironmentPreset::Dusk,
            fog: 0.3,
            sky_color: "#1a1a2e".to_string(),
            ambient_light: 0.8,
        }
    }
}

/// Structure template enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StructureTemplate {
    FloatingLibrary,
    CrystalTower,
    TwistedHouse,
    Portal,
    FloatingIsland,
    InfiniteStaircase,
}

/// A 3D structure in the scene
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Structure {
    pub id: String,
    pub template: StructureTemplate,
    pub pos: [f64; 3],
    /// Uniform scale factor, 0.1..=10
    pub scale: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
}

/// Entity type enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    ParticleSwarm,
    FloatingOrbs,
    LightButterflies,
    ShadowFigures,
    MemoryFragments,
}

/// Per-entity animation parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntityParams {
    /// Movement speed, 0.1..=10
    pub speed: f64,
    /// Glow intensity, 0..=1
    pub glow: f64,
    /// Entity size, 0.1..=5
    pub size: f64,
    /// Hex color, "#rrggbb"
    pub color: String,
}

impl Default for EntityParams {
    fn default() -> Self {
        Self {
            speed: 1.0,
            glow: 0.5,
            size: 1.0,
            color: "#ffffff".to_string(),
        }
    }
}

/// An animated entity group in the scene
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    /// Instance count, 1..=200
    pub count: u32,
    pub params: EntityParams,
}

/// Camera shot type enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShotType {
    Orbital,
    FlyThrough,
    Establish,
    CloseUp,
    Pullback,
}

/// A single camera shot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Shot {
    #[serde(rename = "type")]
    pub shot_type: ShotType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Shot duration in seconds, 2..=60
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_pos: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_pos: Option<[f64; 3]>,
}

/// Cinematography plan for the scene
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cinematography {
    /// Total clip duration in seconds, 10..=300
    pub duration_sec: f64,
    pub shots: Vec<Shot>,
}

/// Render quality enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RenderQuality {
    Draft,
    Medium,
    High,
}

/// Optional render configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenderConfig {
    /// Resolution [width, height], each 240..=4320
    pub res: [u32; 2],
    /// Frames per second, one of 24, 30, 60
    pub fps: u32,
    pub quality: RenderQuality,
}

/// Provenance of an artifact
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    Ai,
    AiRepaired,
    LocalFallback,
    SafeFallback,
    EmergencyFallback,
}

impl ArtifactSource {
    /// True for any of the fallback provenance tags
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            ArtifactSource::LocalFallback
                | ArtifactSource::SafeFallback
                | ArtifactSource::EmergencyFallback
        )
    }
}

impl fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactSource::Ai => "ai",
            ArtifactSource::AiRepaired => "ai_repaired",
            ArtifactSource::LocalFallback => "local_fallback",
            ArtifactSource::SafeFallback => "safe_fallback",
            ArtifactSource::EmergencyFallback => "emergency_fallback",
        };
        f.write_str(s)
    }
}

/// Artifact provenance metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    pub source: ArtifactSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub generated_at: DateTime<Utc>,
    /// Wall time spent producing the artifact, milliseconds
    pub processing_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair_attempts: Option<u32>,
}

impl ArtifactMetadata {
    pub fn new(source: ArtifactSource) -> Self {
        Self {
            source,
            provider: None,
            model: None,
            generated_at: Utc::now(),
            processing_time: 0,
            cache_hit: None,
            repair_attempts: None,
        }
    }
}

/// The validated dream scene specification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DreamArtifact {
    pub id: String,
    /// Human-readable title, 1..=500 chars
    pub title: String,
    pub style: DreamStyle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub environment: Environment,
    pub structures: Vec<Structure>,
    pub entities: Vec<Entity>,
    pub cinematography: Cinematography,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render: Option<RenderConfig>,
    /// Audit trail of repair and fallback decisions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assumptions: Option<Vec<String>>,
    pub metadata: ArtifactMetadata,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl DreamArtifact {
    /// Append an audit note to the assumptions list
    pub fn push_assumption(&mut self, note: impl Into<String>) {
        self.assumptions
            .get_or_insert_with(Vec::new)
            .push(note.into());
    }

    /// Sum of all entity counts
    pub fn total_entity_count(&self) -> u32 {
        self.entities.iter().map(|e| e.count).sum()
    }

    /// Sum of all shot durations
    pub fn total_shot_duration(&self) -> f64 {
        self.cinematography.shots.iter().map(|s| s.duration).sum()
    }
}

/// Structured failure returned to the northbound caller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayFailure {
    pub code: String,
    pub message: String,
    pub hint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_artifact() -> DreamArtifact {
        DreamArtifact {
            id: "dream-1".to_string(),
            title: "A quiet archive".to_string(),
            style: DreamStyle::Ethereal,
            seed: Some(7),
            environment: Environment::default(),
            structures: vec![Structure {
                id: "s1".to_string(),
                template: StructureTemplate::FloatingLibrary,
                pos: [0.0, 10.0, 0.0],
                scale: 1.0,
                rotation: None,
                features: None,
            }],
            entities: vec![Entity {
                id: "e1".to_string(),
                entity_type: EntityType::FloatingOrbs,
                count: 20,
                params: EntityParams::default(),
            }],
            cinematography: Cinematography {
                duration_sec: 30.0,
                shots: vec![Shot {
                    shot_type: ShotType::Orbital,
                    target: Some("s1".to_string()),
                    duration: 30.0,
                    start_pos: None,
                    end_pos: None,
                }],
            },
            render: None,
            assumptions: None,
            metadata: ArtifactMetadata::new(ArtifactSource::Ai),
            created: Utc::now(),
            modified: Utc::now(),
        }
    }

    #[test]
    fn artifact_round_trips_through_json() {
        let artifact = sample_artifact();
        let json = serde_json::to_string(&artifact).unwrap();
        let back: DreamArtifact = serde_json::from_str(&json).unwrap();
        assert_eq!(artifact, back);
    }

    #[test]
    fn wire_format_uses_camel_case_and_lowercase_enums() {
        let artifact = sample_artifact();
        let value = serde_json::to_value(&artifact).unwrap();
        assert_eq!(value["style"], "ethereal");
        assert_eq!(value["environment"]["skyColor"], "#1a1a2e");
        assert_eq!(value["cinematography"]["durationSec"], 30.0);
        assert_eq!(value["structures"][0]["template"], "floating_library");
        assert_eq!(value["entities"][0]["type"], "floating_orbs");
        assert_eq!(value["metadata"]["source"], "ai");
    }

    #[test]
    fn style_parses_case_insensitively() {
        assert_eq!("CyberPunk".parse::<DreamStyle>(), Ok(DreamStyle::Cyberpunk));
        assert!("dreamy".parse::<DreamStyle>().is_err());
    }

    #[test]
    fn assumption_helper_creates_list_on_first_use() {
        let mut artifact = sample_artifact();
        assert!(artifact.assumptions.is_none());
        artifact.push_assumption("clamped fog to 1.0");
        assert_eq!(artifact.assumptions.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn totals_sum_entities_and_shots() {
        let artifact = sample_artifact();
        assert_eq!(artifact.total_entity_count(), 20);
        assert!((artifact.total_shot_duration() - 30.0).abs() < f64::EPSILON);
    }
}
