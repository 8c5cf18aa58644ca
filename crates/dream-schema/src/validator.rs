//! Dream artifact schema validation
//!
//! Validation is pure and exhaustive: it never mutates its input and it
//! reports every violation instead of stopping at the first. Callers decide
//! whether to repair or reject.

use dream_common::types::{
    DreamArtifact, MAX_ENTITIES, MAX_POSITION_MAGNITUDE, MAX_SHOTS, MAX_STRUCTURES,
    MAX_TOTAL_ENTITY_COUNT, SHOT_SUM_TOLERANCE,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static HEX_COLOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#[0-9a-fA-F]{6}$").expect("hex color regex"));

pub const STYLES: &[&str] = &["ethereal", "cyberpunk", "surreal", "fantasy", "nightmare"];
pub const PRESETS: &[&str] = &["dawn", "dusk", "night", "void", "underwater"];
pub const TEMPLATES: &[&str] = &[
    "floating_library",
    "crystal_tower",
    "twisted_house",
    "portal",
    "floating_island",
    "infinite_staircase",
];
pub const ENTITY_TYPES: &[&str] = &[
    "particle_swarm",
    "floating_orbs",
    "light_butterflies",
    "shadow_figures",
    "memory_fragments",
];
pub const SHOT_TYPES: &[&str] = &["orbital", "fly_through", "establish", "close_up", "pullback"];
pub const SOURCES: &[&str] = &[
    "ai",
    "ai_repaired",
    "local_fallback",
    "safe_fallback",
    "emergency_fallback",
];
pub const ALLOWED_FPS: &[u64] = &[24, 30, 60];

/// One schema violation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    /// Dotted path of the offending field, e.g. `structures[2].scale`
    pub field: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            expected: None,
            actual: None,
        }
    }

    fn expecting(
        field: impl Into<String>,
        message: impl Into<String>,
        expected: impl Into<String>,
        actual: &Value,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            expected: Some(expected.into()),
            actual: Some(compact(actual)),
        }
    }
}

/// Validation outcome: valid flag plus every violation found
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

impl ValidationReport {
    pub fn has_error_on(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }
}

fn compact(value: &Value) -> String {
    let s = value.to_string();
    if s.len() > 80 {
        let mut cut = 80;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &s[..cut])
    } else {
        s
    }
}

/// Validate a typed artifact
pub fn validate_artifact(artifact: &DreamArtifact) -> ValidationReport {
    match serde_json::to_value(artifact) {
        Ok(value) => validate_value(&value),
        Err(e) => ValidationReport {
            valid: false,
            errors: vec![ValidationError::new("$", format!("unserializable artifact: {e}"))],
        },
    }
}

/// Validate a raw JSON value against the dream schema.
///
/// Phase one checks structure: types, enums, ranges, formats, bounds.
/// Phase two checks cross-field invariants.
pub fn validate_value(value: &Value) -> ValidationReport {
    let mut errors = Vec::new();

    let root = match value.as_object() {
        Some(map) => map,
        None => {
            return ValidationReport {
                valid: false,
                errors: vec![ValidationError::expecting(
                    "$",
                    "artifact must be a JSON object",
                    "object",
                    value,
                )],
            };
        }
    };

    // --- Phase 1: structural ---

    check_string_len(root.get("id"), "id", 1, 256, true, &mut errors);
    check_string_len(root.get("title"), "title", 1, 500, true, &mut errors);
    check_enum(root.get("style"), "style", STYLES, true, &mut errors);

    if let Some(seed) = root.get("seed") {
        if !seed.is_null() && seed.as_u64().is_none() {
            errors.push(ValidationError::expecting(
                "seed",
                "seed must be a non-negative integer",
                "u64",
                seed,
            ));
        }
    }

    match root.get("environment") {
        Some(Value::Object(env)) => {
            check_enum(env.get("preset"), "environment.preset", PRESETS, true, &mut errors);
            check_range(env.get("fog"), "environment.fog", 0.0, 1.0, true, &mut errors);
            check_color(env.get("skyColor"), "environment.skyColor", true, &mut errors);
            check_range(
                env.get("ambientLight"),
                "environment.ambientLight",
                0.0,
                3.0,
                true,
                &mut errors,
            );
        }
        Some(other) => errors.push(ValidationError::expecting(
            "environment",
            "environment must be an object",
            "object",
            other,
        )),
        None => errors.push(ValidationError::new("environment", "environment is required")),
    }

    match root.get("structures") {
        Some(Value::Array(structures)) => {
            if structures.len() > MAX_STRUCTURES {
                errors.push(ValidationError::new(
                    "structures",
                    format!("at most {MAX_STRUCTURES} structures allowed, found {}", structures.len()),
                ));
            }
            for (i, structure) in structures.iter().enumerate() {
                validate_structure(structure, i, &mut errors);
            }
        }
        Some(other) => errors.push(ValidationError::expecting(
            "structures",
            "structures must be an array",
            "array",
            other,
        )),
        None => errors.push(ValidationError::new("structures", "structures is required")),
    }

    match root.get("entities") {
        Some(Value::Array(entities)) => {
            if entities.len() > MAX_ENTITIES {
                errors.push(ValidationError::new(
                    "entities",
                    format!("at most {MAX_ENTITIES} entities allowed, found {}", entities.len()),
                ));
            }
            for (i, entity) in entities.iter().enumerate() {
                validate_entity(entity, i, &mut errors);
            }
        }
        Some(other) => errors.push(ValidationError::expecting(
            "entities",
            "entities must be an array",
            "array",
            other,
        )),
        None => errors.push(ValidationError::new("entities", "entities is required")),
    }

    match root.get("cinematography") {
        Some(Value::Object(cine)) => validate_cinematography(cine, &mut errors),
        Some(other) => errors.push(ValidationError::expecting(
            "cinematography",
            "cinematography must be an object",
            "object",
            other,
        )),
        None => errors.push(ValidationError::new(
            "cinematography",
            "cinematography is required",
        )),
    }

    if let Some(render) = root.get("render").filter(|v| !v.is_null()) {
        validate_render(render, &mut errors);
    }

    if let Some(assumptions) = root.get("assumptions").filter(|v| !v.is_null()) {
        match assumptions.as_array() {
            Some(list) => {
                for (i, note) in list.iter().enumerate() {
                    if !note.is_string() {
                        errors.push(ValidationError::expecting(
                            format!("assumptions[{i}]"),
                            "assumption must be a string",
                            "string",
                            note,
                        ));
                    }
                }
            }
            None => errors.push(ValidationError::expecting(
                "assumptions",
                "assumptions must be an array of strings",
                "array",
                assumptions,
            )),
        }
    }

    match root.get("metadata") {
        Some(Value::Object(meta)) => {
            check_enum(meta.get("source"), "metadata.source", SOURCES, true, &mut errors);
            check_timestamp(meta.get("generatedAt"), "metadata.generatedAt", &mut errors);
        }
        Some(other) => errors.push(ValidationError::expecting(
            "metadata",
            "metadata must be an object",
            "object",
            other,
        )),
        None => errors.push(ValidationError::new("metadata", "metadata is required")),
    }

    check_timestamp(root.get("created"), "created", &mut errors);
    check_timestamp(root.get("modified"), "modified", &mut errors);

    // --- Phase 2: cross-field invariants ---

    if let Some(entities) = root.get("entities").and_then(Value::as_array) {
        let total: u64 = entities
            .iter()
            .filter_map(|e| e.get("count").and_then(Value::as_u64))
            .sum();
        if total > MAX_TOTAL_ENTITY_COUNT as u64 {
            errors.push(ValidationError::new(
                "entities",
                format!("total entity count {total} exceeds {MAX_TOTAL_ENTITY_COUNT}"),
            ));
        }
    }

    if let Some(cine) = root.get("cinematography").and_then(Value::as_object) {
        if let (Some(duration), Some(shots)) = (
            cine.get("durationSec").and_then(Value::as_f64),
            cine.get("shots").and_then(Value::as_array),
        ) {
            let sum: f64 = shots
                .iter()
                .filter_map(|s| s.get("duration").and_then(Value::as_f64))
                .sum();
            if (sum - duration).abs() > SHOT_SUM_TOLERANCE {
                errors.push(ValidationError::new(
                    "cinematography.durationSec",
                    format!(
                        "shot durations sum to {sum:.1}s but durationSec is {duration:.1}s (tolerance {SHOT_SUM_TOLERANCE}s)"
                    ),
                ));
            }
        }
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
    }
}

fn validate_structure(value: &Value, index: usize, errors: &mut Vec<ValidationError>) {
    let path = format!("structures[{index}]");
    let structure = match value.as_object() {
        Some(map) => map,
        None => {
            errors.push(ValidationError::expecting(
                path,
                "structure must be an object",
                "object",
                value,
            ));
            return;
        }
    };

    check_string_len(structure.get("id"), format!("{path}.id"), 1, 256, true, errors);
    check_enum(
        structure.get("template"),
        format!("{path}.template"),
        TEMPLATES,
        true,
        errors,
    );
    check_vec3(structure.get("pos"), format!("{path}.pos"), true, errors);
    check_range(structure.get("scale"), format!("{path}.scale"), 0.1, 10.0, true, errors);
    if let Some(rotation) = structure.get("rotation").filter(|v| !v.is_null()) {
        check_vec3(Some(rotation), format!("{path}.rotation"), true, errors);
    }
    if let Some(features) = structure.get("features").filter(|v| !v.is_null()) {
        if !features.is_array() {
            errors.push(ValidationError::expecting(
                format!("{path}.features"),
                "features must be an array of strings",
                "array",
                features,
            ));
        }
    }

    // Position magnitude bound
    if let Some(pos) = structure.get("pos").and_then(Value::as_array) {
        for (axis, coord) in pos.iter().enumerate() {
            if let Some(c) = coord.as_f64() {
                if c.abs() > MAX_POSITION_MAGNITUDE {
                    errors.push(ValidationError::new(
                        format!("{path}.pos[{axis}]"),
                        format!("|coordinate| must be ≤ {MAX_POSITION_MAGNITUDE}, found {c}"),
                    ));
                }
            }
        }
    }
}

fn validate_entity(value: &Value, index: usize, errors: &mut Vec<ValidationError>) {
    let path = format!("entities[{index}]");
    let entity = match value.as_object() {
        Some(map) => map,
        None => {
            errors.push(ValidationError::expecting(
                path,
                "entity must be an object",
                "object",
                value,
            ));
            return;
        }
    };

    check_string_len(entity.get("id"), format!("{path}.id"), 1, 256, true, errors);
    check_enum(entity.get("type"), format!("{path}.type"), ENTITY_TYPES, true, errors);

    match entity.get("count").and_then(Value::as_u64) {
        Some(count) if (1..=200).contains(&count) => {}
        _ => errors.push(ValidationError::expecting(
            format!("{path}.count"),
            "count must be an integer in 1..=200",
            "1..=200",
            entity.get("count").unwrap_or(&Value::Null),
        )),
    }

    match entity.get("params") {
        Some(Value::Object(params)) => {
            check_range(params.get("speed"), format!("{path}.params.speed"), 0.1, 10.0, true, errors);
            check_range(params.get("glow"), format!("{path}.params.glow"), 0.0, 1.0, true, errors);
            check_range(params.get("size"), format!("{path}.params.size"), 0.1, 5.0, true, errors);
            check_color(params.get("color"), format!("{path}.params.color"), true, errors);
        }
        _ => errors.push(ValidationError::new(
            format!("{path}.params"),
            "params object is required",
        )),
    }
}

fn validate_cinematography(
    cine: &serde_json::Map<String, Value>,
    errors: &mut Vec<ValidationError>,
) {
    check_range(
        cine.get("durationSec"),
        "cinematography.durationSec",
        10.0,
        300.0,
        true,
        errors,
    );

    match cine.get("shots") {
        Some(Value::Array(shots)) => {
            if shots.is_empty() || shots.len() > MAX_SHOTS {
                errors.push(ValidationError::new(
                    "cinematography.shots",
                    format!("shot count must be in 1..={MAX_SHOTS}, found {}", shots.len()),
                ));
            }
            for (i, shot) in shots.iter().enumerate() {
                let path = format!("cinematography.shots[{i}]");
                match shot.as_object() {
                    Some(map) => {
                        check_enum(map.get("type"), format!("{path}.type"), SHOT_TYPES, true, errors);
                        check_range(map.get("duration"), format!("{path}.duration"), 2.0, 60.0, true, errors);
                        if let Some(pos) = map.get("startPos").filter(|v| !v.is_null()) {
                            check_vec3(Some(pos), format!("{path}.startPos"), true, errors);
                        }
                        if let Some(pos) = map.get("endPos").filter(|v| !v.is_null()) {
                            check_vec3(Some(pos), format!("{path}.endPos"), true, errors);
                        }
                    }
                    None => errors.push(ValidationError::expecting(
                        path,
                        "shot must be an object",
                        "object",
                        shot,
                    )),
                }
            }
        }
        Some(other) => errors.push(ValidationError::expecting(
            "cinematography.shots",
            "shots must be an array",
            "array",
            other,
        )),
        None => errors.push(ValidationError::new("cinematography.shots", "shots is required")),
    }
}

fn validate_render(value: &Value, errors: &mut Vec<ValidationError>) {
    let render = match value.as_object() {
        Some(map) => map,
        None => {
            errors.push(ValidationError::expecting(
                "render",
                "render must be an object",
                "object",
                value,
            ));
            return;
        }
    };

    match render.get("res").and_then(Value::as_array) {
        Some(res) if res.len() == 2 => {
            for (i, dim) in res.iter().enumerate() {
                match dim.as_u64() {
                    Some(d) if (240..=4320).contains(&d) => {}
                    _ => errors.push(ValidationError::expecting(
                        format!("render.res[{i}]"),
                        "resolution must be in 240..=4320",
                        "240..=4320",
                        dim,
                    )),
                }
            }
        }
        _ => errors.push(ValidationError::new(
            "render.res",
            "res must be a [width, height] pair",
        )),
    }

    match render.get("fps").and_then(Value::as_u64) {
        Some(fps) if ALLOWED_FPS.contains(&fps) => {}
        _ => errors.push(ValidationError::expecting(
            "render.fps",
            "fps must be one of 24, 30, 60",
            "24|30|60",
            render.get("fps").unwrap_or(&Value::Null),
        )),
    }

    check_enum(
        render.get("quality"),
        "render.quality",
        &["draft", "medium", "high"],
        true,
        errors,
    );
}

fn check_string_len(
    value: Option<&Value>,
    field: impl Into<String>,
    min: usize,
    max: usize,
    required: bool,
    errors: &mut Vec<ValidationError>,
) {
    let field = field.into();
    match value {
        Some(Value::String(s)) => {
            let len = s.chars().count();
            if len < min || len > max {
                errors.push(ValidationError::new(
                    field,
                    format!("length must be in {min}..={max}, found {len}"),
                ));
            }
        }
        Some(other) => errors.push(ValidationError::expecting(
            field,
            "must be a string",
            "string",
            other,
        )),
        None if required => errors.push(ValidationError::new(field, "field is required")),
        None => {}
    }
}

fn check_enum(
    value: Option<&Value>,
    field: impl Into<String>,
    allowed: &[&str],
    required: bool,
    errors: &mut Vec<ValidationError>,
) {
    let field = field.into();
    match value {
        Some(Value::String(s)) if allowed.contains(&s.as_str()) => {}
        Some(other) => errors.push(ValidationError::expecting(
            field,
            "value not in enum",
            allowed.join("|"),
            other,
        )),
        None if required => errors.push(ValidationError::new(field, "field is required")),
        None => {}
    }
}

fn check_range(
    value: Option<&Value>,
    field: impl Into<String>,
    min: f64,
    max: f64,
    required: bool,
    errors: &mut Vec<ValidationError>,
) {
    let field = field.into();
    match value.and_then(Value::as_f64) {
        Some(n) if n >= min && n <= max => {}
        Some(_) | None if !required && value.is_none() => {}
        _ => errors.push(ValidationError::expecting(
            field,
            format!("must be a number in [{min}, {max}]"),
            format!("[{min}, {max}]"),
            value.unwrap_or(&Value::Null),
        )),
    }
}

fn check_color(
    value: Option<&Value>,
    field: impl Into<String>,
    required: bool,
    errors: &mut Vec<ValidationError>,
) {
    let field = field.into();
    match value {
        Some(Value::String(s)) if HEX_COLOR.is_match(s) => {}
        Some(other) => errors.push(ValidationError::expecting(
            field,
            "must be a hex color like #1a2b3c",
            "#rrggbb",
            other,
        )),
        None if required => errors.push(ValidationError::new(field, "field is required")),
        None => {}
    }
}

fn check_vec3(
    value: Option<&Value>,
    field: impl Into<String>,
    required: bool,
    errors: &mut Vec<ValidationError>,
) {
    let field = field.into();
    match value {
        Some(Value::Array(items)) if items.len() == 3 && items.iter().all(|i| i.as_f64().is_some()) => {}
        Some(other) => errors.push(ValidationError::expecting(
            field,
            "must be an [x, y, z] number triple",
            "[f64; 3]",
            other,
        )),
        None if required => errors.push(ValidationError::new(field, "field is required")),
        None => {}
    }
}

fn check_timestamp(value: Option<&Value>, field: &str, errors: &mut Vec<ValidationError>) {
    match value {
        Some(Value::String(s)) => {
            if chrono::DateTime::parse_from_rfc3339(s).is_err() {
                errors.push(ValidationError::expecting(
                    field,
                    "must be an ISO-8601 timestamp",
                    "ISO-8601",
                    value.unwrap_or(&Value::Null),
                ));
            }
        }
        Some(other) => errors.push(ValidationError::expecting(
            field,
            "must be an ISO-8601 timestamp string",
            "ISO-8601",
            other,
        )),
        None => errors.push(ValidationError::new(field, "field is required")),
    }
}

/// A fully valid artifact value shared by this crate's tests
#[cfg(test)]
pub(crate) fn valid_artifact_value() -> Value {
    serde_json::json!({
        "id": "dream-1",
        "title": "A glass city at dusk",
        "style": "cyberpunk",
        "seed": 42,
        "environment": {
            "preset": "dusk",
            "fog": 0.4,
            "skyColor": "#2e1a47",
            "ambientLight": 1.2
        },
        "structures": [
            {
                "id": "s1",
                "template": "crystal_tower",
                "pos": [0.0, 20.0, -5.0],
                "scale": 2.5,
                "rotation": [0.0, 45.0, 0.0],
                "features": ["glowing_edges"]
            }
        ],
        "entities": [
            {
                "id": "e1",
                "type": "floating_orbs",
                "count": 50,
                "params": {"speed": 1.0, "glow": 0.8, "size": 0.5, "color": "#00ffcc"}
            }
        ],
        "cinematography": {
            "durationSec": 30.0,
            "shots": [
                {"type": "establish", "duration": 10.0},
                {"type": "orbital", "target": "s1", "duration": 20.0}
            ]
        },
        "render": {"res": [1280, 720], "fps": 30, "quality": "medium"},
        "metadata": {
            "source": "ai",
            "provider": "alpha",
            "generatedAt": "2026-08-01T12:00:00Z",
            "processingTime": 1200
        },
        "created": "2026-08-01T12:00:00Z",
        "modified": "2026-08-01T12:00:00Z"
    })
}
