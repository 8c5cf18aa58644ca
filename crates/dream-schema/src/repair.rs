//! Iterative artifact repair
//!
//! Drives validate→repair→revalidate until the artifact is schema-valid or
//! the attempt budget runs out. Strategies are applied in a fixed order:
//! defaults, clamping, enum coercion, structural drop, duration
//! reconciliation. Every applied repair is recorded in the artifact's
//! `assumptions` audit trail.

use crate::validator::{
    validate_value, ValidationError, ENTITY_TYPES, PRESETS, SHOT_TYPES, STYLES, TEMPLATES,
};
use chrono::Utc;
use dream_common::types::{
    DreamArtifact, DreamStyle, MAX_ENTITIES, MAX_POSITION_MAGNITUDE, MAX_SHOTS, MAX_STRUCTURES,
    MAX_TOTAL_ENTITY_COUNT, SHOT_SUM_TOLERANCE,
};
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

/// Context the pipeline uses to choose sensible defaults
#[derive(Debug, Clone)]
pub struct RepairContext {
    pub style: DreamStyle,
    pub title_hint: String,
    pub requested_duration: Option<f64>,
    pub seed: Option<u64>,
}

impl Default for RepairContext {
    fn default() -> Self {
        Self {
            style: DreamStyle::Ethereal,
            title_hint: "Untitled Dream".to_string(),
            requested_duration: None,
            seed: None,
        }
    }
}

/// Final verdict of a repair run
#[derive(Debug, Clone, PartialEq)]
pub enum RepairVerdict {
    /// The artifact validates; `repaired` is false when no strategy touched it
    Valid { repaired: bool },
    /// Required content is missing; the orchestrator should resubmit with
    /// the prompt addendum or fall back
    NeedsRegeneration {
        missing: Vec<String>,
        prompt_addendum: String,
    },
}

/// Outcome of a pipeline run
#[derive(Debug, Clone)]
pub struct RepairResult {
    pub artifact: Option<DreamArtifact>,
    pub verdict: RepairVerdict,
    pub assumptions: Vec<String>,
    pub attempts: u32,
    pub remaining_errors: Vec<ValidationError>,
}

/// The validate→repair→revalidate driver
#[derive(Debug, Clone)]
pub struct RepairPipeline {
    max_attempts: u32,
}

impl Default for RepairPipeline {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

impl RepairPipeline {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    pub fn run(&self, mut value: Value, ctx: &RepairContext) -> RepairResult {
        if !value.is_object() {
            return RepairResult {
                artifact: None,
                verdict: RepairVerdict::NeedsRegeneration {
                    missing: vec!["$".to_string()],
                    prompt_addendum: "Return exactly one JSON object describing the dream scene, \
                                      with no surrounding text."
                        .to_string(),
                },
                assumptions: Vec::new(),
                attempts: 0,
                remaining_errors: Vec::new(),
            };
        }

        // A scene with neither structures nor entities has no content worth
        // defaulting; ask for regeneration instead of inventing a scene.
        if Self::lacks_content(&value) {
            return RepairResult {
                artifact: None,
                verdict: RepairVerdict::NeedsRegeneration {
                    missing: vec!["structures".to_string(), "entities".to_string()],
                    prompt_addendum: "Your previous response was missing the scene content. \
                                      Include non-empty \"structures\" and \"entities\" arrays \
                                      in the JSON object."
                        .to_string(),
                },
                assumptions: Vec::new(),
                attempts: 0,
                remaining_errors: Vec::new(),
            };
        }

        let mut assumptions = Vec::new();
        let mut attempts = 0u32;

        loop {
            let report = validate_value(&value);
            if report.valid {
                return self.finalize(value, assumptions, attempts);
            }
            if attempts >= self.max_attempts {
                debug!(attempts, errors = report.errors.len(), "repair budget exhausted");
                let missing: Vec<String> =
                    report.errors.iter().map(|e| e.field.clone()).collect();
                return RepairResult {
                    artifact: None,
                    verdict: RepairVerdict::NeedsRegeneration {
                        prompt_addendum: format!(
                            "The JSON object had invalid fields: {}. Correct these fields and \
                             return the full object again.",
                            missing.join(", ")
                        ),
                        missing,
                    },
                    assumptions,
                    attempts,
                    remaining_errors: report.errors,
                };
            }

            attempts += 1;
            apply_defaults(&mut value, ctx, &mut assumptions);
            apply_clamping(&mut value, &mut assumptions);
            apply_enum_coercion(&mut value, ctx, &mut assumptions);
            apply_structural_drop(&mut value, &mut assumptions);
            reconcile_durations(&mut value, &mut assumptions);
        }
    }

    fn lacks_content(value: &Value) -> bool {
        let empty = |field: &str| {
            value
                .get(field)
                .and_then(Value::as_array)
                .map(|a| a.is_empty())
                .unwrap_or(true)
        };
        empty("structures") && empty("entities")
    }

    fn finalize(
        &self,
        mut value: Value,
        assumptions: Vec<String>,
        attempts: u32,
    ) -> RepairResult {
        let repaired = !assumptions.is_empty();
        if repaired {
            let existing = value
                .get("assumptions")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let merged: Vec<Value> = existing
                .into_iter()
                .chain(assumptions.iter().map(|a| Value::String(a.clone())))
                .collect();
            value["assumptions"] = Value::Array(merged);
        }

        match serde_json::from_value::<DreamArtifact>(value) {
            Ok(artifact) => RepairResult {
                artifact: Some(artifact),
                verdict: RepairVerdict::Valid { repaired },
                assumptions,
                attempts,
                remaining_errors: Vec::new(),
            },
            Err(e) => {
                // Schema-valid JSON should always deserialize; treat a gap
                // between the two as a regeneration case.
                debug!("valid artifact failed to deserialize: {e}");
                RepairResult {
                    artifact: None,
                    verdict: RepairVerdict::NeedsRegeneration {
                        missing: vec!["$".to_string()],
                        prompt_addendum:
                            "Return the complete dream JSON object with all required fields."
                                .to_string(),
                    },
                    assumptions,
                    attempts,
                    remaining_errors: Vec::new(),
                }
            }
        }
    }
}

// --- Strategy 1: defaults for missing fields ---

fn apply_defaults(value: &mut Value, ctx: &RepairContext, assumptions: &mut Vec<String>) {
    let now = Utc::now().to_rfc3339();
    let root = match value.as_object_mut() {
        Some(map) => map,
        None => return,
    };

    if !root.get("id").map(Value::is_string).unwrap_or(false) {
        root.insert("id".to_string(), json!(format!("dream-{}", Uuid::new_v4())));
        assumptions.push("generated a fresh artifact id".to_string());
    }

    let title_missing = root
        .get("title")
        .and_then(Value::as_str)
        .map(|t| t.trim().is_empty())
        .unwrap_or(true);
    if title_missing {
        root.insert("title".to_string(), json!(ctx.title_hint.clone()));
        assumptions.push("derived title from the dream text".to_string());
    }

    if !root.get("style").map(Value::is_string).unwrap_or(false) {
        root.insert("style".to_string(), json!(ctx.style.to_string()));
        assumptions.push(format!("defaulted style to {}", ctx.style));
    }

    if let Some(seed) = root.get("seed") {
        if !seed.is_null() && seed.as_u64().is_none() {
            match ctx.seed {
                Some(s) => root.insert("seed".to_string(), json!(s)),
                None => root.remove("seed"),
            };
            assumptions.push("discarded an invalid seed value".to_string());
        }
    }

    if !root.get("environment").map(Value::is_object).unwrap_or(false) {
        root.insert(
            "environment".to_string(),
            json!({"preset": "dusk", "fog": 0.3, "skyColor": "#1a1a2e", "ambientLight": 0.8}),
        );
        assumptions.push("filled in a default environment".to_string());
    } else if let Some(env) = root.get_mut("environment").and_then(Value::as_object_mut) {
        for (key, default, note) in [
            ("preset", json!("dusk"), "environment preset"),
            ("fog", json!(0.3), "environment fog"),
            ("skyColor", json!("#1a1a2e"), "environment sky color"),
            ("ambientLight", json!(0.8), "environment ambient light"),
        ] {
            if env.get(key).map(Value::is_null).unwrap_or(true) {
                env.insert(key.to_string(), default);
                assumptions.push(format!("defaulted missing {note}"));
            }
        }
    }

    for field in ["structures", "entities"] {
        if !root.get(field).map(Value::is_array).unwrap_or(false) {
            root.insert(field.to_string(), json!([]));
            assumptions.push(format!("defaulted {field} to an empty list"));
        }
    }

    default_structures(root, assumptions);
    default_entities(root, assumptions);
    default_cinematography(root, ctx, assumptions);

    if !root.get("metadata").map(Value::is_object).unwrap_or(false) {
        root.insert(
            "metadata".to_string(),
            json!({"source": "ai", "generatedAt": now, "processingTime": 0}),
        );
        assumptions.push("filled in provenance metadata".to_string());
    } else if let Some(meta) = root.get_mut("metadata").and_then(Value::as_object_mut) {
        if meta.get("source").map(Value::is_null).unwrap_or(true) {
            meta.insert("source".to_string(), json!("ai"));
            assumptions.push("defaulted metadata source".to_string());
        }
        if meta
            .get("generatedAt")
            .and_then(Value::as_str)
            .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_err())
            .unwrap_or(true)
        {
            meta.insert("generatedAt".to_string(), json!(now.clone()));
            assumptions.push("stamped metadata generation time".to_string());
        }
    }

    for field in ["created", "modified"] {
        let invalid = root
            .get(field)
            .and_then(Value::as_str)
            .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_err())
            .unwrap_or(true);
        if invalid {
            root.insert(field.to_string(), json!(now.clone()));
            assumptions.push(format!("stamped {field} timestamp"));
        }
    }
}

fn default_structures(root: &mut Map<String, Value>, assumptions: &mut Vec<String>) {
    let structures = match root.get_mut("structures").and_then(Value::as_array_mut) {
        Some(list) => list,
        None => return,
    };
    for (i, structure) in structures.iter_mut().enumerate() {
        let map = match structure.as_object_mut() {
            Some(map) => map,
            None => continue,
        };
        if !map.get("id").map(Value::is_string).unwrap_or(false) {
            map.insert("id".to_string(), json!(format!("structure-{}", i + 1)));
            assumptions.push(format!("assigned an id to structure {}", i + 1));
        }
        if map.get("pos").and_then(Value::as_array).map(|p| p.len() != 3).unwrap_or(true) {
            map.insert("pos".to_string(), json!([i as f64 * 12.0, 10.0, 0.0]));
            assumptions.push(format!("placed structure {} at a default position", i + 1));
        }
        if map.get("scale").and_then(Value::as_f64).is_none() {
            map.insert("scale".to_string(), json!(1.0));
            assumptions.push(format!("defaulted scale for structure {}", i + 1));
        }
    }
}

fn default_entities(root: &mut Map<String, Value>, assumptions: &mut Vec<String>) {
    let entities = match root.get_mut("entities").and_then(Value::as_array_mut) {
        Some(list) => list,
        None => return,
    };
    for (i, entity) in entities.iter_mut().enumerate() {
        let map = match entity.as_object_mut() {
            Some(map) => map,
            None => continue,
        };
        if !map.get("id").map(Value::is_string).unwrap_or(false) {
            map.insert("id".to_string(), json!(format!("entity-{}", i + 1)));
            assumptions.push(format!("assigned an id to entity {}", i + 1));
        }
        if map.get("count").and_then(Value::as_u64).is_none() {
            map.insert("count".to_string(), json!(10));
            assumptions.push(format!("defaulted count for entity {}", i + 1));
        }
        if !map.get("params").map(Value::is_object).unwrap_or(false) {
            map.insert(
                "params".to_string(),
                json!({"speed": 1.0, "glow": 0.5, "size": 1.0, "color": "#ffffff"}),
            );
            assumptions.push(format!("defaulted params for entity {}", i + 1));
        } else if let Some(params) = map.get_mut("params").and_then(Value::as_object_mut) {
            for (key, default) in [
                ("speed", json!(1.0)),
                ("glow", json!(0.5)),
                ("size", json!(1.0)),
                ("color", json!("#ffffff")),
            ] {
                if params.get(key).map(Value::is_null).unwrap_or(true) {
                    params.insert(key.to_string(), default);
                    assumptions.push(format!("defaulted {key} for entity {}", i + 1));
                }
            }
        }
    }
}

fn default_cinematography(
    root: &mut Map<String, Value>,
    ctx: &RepairContext,
    assumptions: &mut Vec<String>,
) {
    let requested = ctx.requested_duration.unwrap_or(30.0).clamp(10.0, 300.0);

    if !root.get("cinematography").map(Value::is_object).unwrap_or(false) {
        root.insert(
            "cinematography".to_string(),
            json!({"durationSec": requested, "shots": default_shots(requested)}),
        );
        assumptions.push("built a default cinematography plan".to_string());
        return;
    }

    let cine = match root.get_mut("cinematography").and_then(Value::as_object_mut) {
        Some(cine) => cine,
        None => return,
    };

    let shots_missing = cine
        .get("shots")
        .and_then(Value::as_array)
        .map(|s| s.is_empty())
        .unwrap_or(true);
    let duration = cine.get("durationSec").and_then(Value::as_f64);

    if duration.is_none() {
        let derived = cine
            .get("shots")
            .and_then(Value::as_array)
            .map(|shots| {
                shots
                    .iter()
                    .filter_map(|s| s.get("duration").and_then(Value::as_f64))
                    .sum::<f64>()
            })
            .filter(|sum| *sum > 0.0)
            .map(|sum| sum.clamp(10.0, 300.0))
            .unwrap_or(requested);
        cine.insert("durationSec".to_string(), json!(derived));
        assumptions.push("recalculated durationSec from the shot list".to_string());
    }

    if shots_missing {
        let duration = cine
            .get("durationSec")
            .and_then(Value::as_f64)
            .unwrap_or(requested)
            .clamp(10.0, 300.0);
        cine.insert("shots".to_string(), json!(default_shots(duration)));
        assumptions.push("built a default shot list".to_string());
    } else if let Some(shots) = cine.get_mut("shots").and_then(Value::as_array_mut) {
        let per_shot = requested / shots.len().max(1) as f64;
        for (i, shot) in shots.iter_mut().enumerate() {
            if let Some(map) = shot.as_object_mut() {
                if map.get("duration").and_then(Value::as_f64).is_none() {
                    map.insert("duration".to_string(), json!(per_shot.clamp(2.0, 60.0)));
                    assumptions.push(format!("defaulted duration for shot {}", i + 1));
                }
                if !map.get("type").map(Value::is_string).unwrap_or(false) {
                    map.insert("type".to_string(), json!("orbital"));
                    assumptions.push(format!("defaulted type for shot {}", i + 1));
                }
            }
        }
    }
}

/// Even split of the duration into 2..=60 second segments
fn default_shots(duration: f64) -> Vec<Value> {
    let segments = ((duration / 60.0).ceil() as usize).clamp(1, MAX_SHOTS);
    let per_segment = duration / segments as f64;
    (0..segments)
        .map(|i| {
            let shot_type = if i == 0 { "establish" } else { "orbital" };
            json!({"type": shot_type, "duration": per_segment})
        })
        .collect()
}

// --- Strategy 2: clamp numeric fields into range ---

fn apply_clamping(value: &mut Value, assumptions: &mut Vec<String>) {
    let root = match value.as_object_mut() {
        Some(map) => map,
        None => return,
    };

    if let Some(title) = root.get("title").and_then(Value::as_str) {
        if title.chars().count() > 500 {
            let truncated: String = title.chars().take(500).collect();
            root.insert("title".to_string(), json!(truncated));
            assumptions.push("truncated an over-long title".to_string());
        }
    }

    if let Some(env) = root.get_mut("environment").and_then(Value::as_object_mut) {
        clamp_field(env, "fog", 0.0, 1.0, "environment.fog", assumptions);
        clamp_field(env, "ambientLight", 0.0, 3.0, "environment.ambientLight", assumptions);
    }

    if let Some(structures) = root.get_mut("structures").and_then(Value::as_array_mut) {
        for (i, structure) in structures.iter_mut().enumerate() {
            let map = match structure.as_object_mut() {
                Some(map) => map,
                None => continue,
            };
            clamp_field(map, "scale", 0.1, 10.0, &format!("structures[{i}].scale"), assumptions);
            if let Some(pos) = map.get_mut("pos").and_then(Value::as_array_mut) {
                for (axis, coord) in pos.iter_mut().enumerate() {
                    if let Some(c) = coord.as_f64() {
                        if c.abs() > MAX_POSITION_MAGNITUDE {
                            let clamped = c.clamp(-MAX_POSITION_MAGNITUDE, MAX_POSITION_MAGNITUDE);
                            *coord = json!(clamped);
                            assumptions.push(format!(
                                "clamped structures[{i}].pos[{axis}] from {c} to {clamped}"
                            ));
                        }
                    }
                }
            }
        }
    }

    if let Some(entities) = root.get_mut("entities").and_then(Value::as_array_mut) {
        for (i, entity) in entities.iter_mut().enumerate() {
            let map = match entity.as_object_mut() {
                Some(map) => map,
                None => continue,
            };
            if let Some(count) = map.get("count").and_then(Value::as_f64) {
                let clamped = (count.round() as i64).clamp(1, 200);
                if (clamped as f64 - count).abs() > f64::EPSILON {
                    map.insert("count".to_string(), json!(clamped));
                    assumptions.push(format!(
                        "clamped entities[{i}].count from {count} to {clamped}"
                    ));
                }
            }
            if let Some(params) = map.get_mut("params").and_then(Value::as_object_mut) {
                clamp_field(params, "speed", 0.1, 10.0, &format!("entities[{i}].params.speed"), assumptions);
                clamp_field(params, "glow", 0.0, 1.0, &format!("entities[{i}].params.glow"), assumptions);
                clamp_field(params, "size", 0.1, 5.0, &format!("entities[{i}].params.size"), assumptions);
            }
        }
    }

    if let Some(cine) = root.get_mut("cinematography").and_then(Value::as_object_mut) {
        clamp_field(cine, "durationSec", 10.0, 300.0, "cinematography.durationSec", assumptions);
        if let Some(shots) = cine.get_mut("shots").and_then(Value::as_array_mut) {
            for (i, shot) in shots.iter_mut().enumerate() {
                if let Some(map) = shot.as_object_mut() {
                    clamp_field(
                        map,
                        "duration",
                        2.0,
                        60.0,
                        &format!("cinematography.shots[{i}].duration"),
                        assumptions,
                    );
                }
            }
        }
    }

    if let Some(render) = root.get_mut("render").and_then(Value::as_object_mut) {
        if let Some(res) = render.get_mut("res").and_then(Value::as_array_mut) {
            for (i, dim) in res.iter_mut().enumerate() {
                if let Some(d) = dim.as_f64() {
                    let clamped = (d.round() as i64).clamp(240, 4320);
                    if (clamped as f64 - d).abs() > f64::EPSILON {
                        *dim = json!(clamped);
                        assumptions.push(format!("clamped render.res[{i}] from {d} to {clamped}"));
                    }
                }
            }
        }
        if let Some(fps) = render.get("fps").and_then(Value::as_f64) {
            if ![24.0, 30.0, 60.0].contains(&fps) {
                let nearest = [24u32, 30, 60]
                    .into_iter()
                    .min_by(|a, b| {
                        (*a as f64 - fps)
                            .abs()
                            .partial_cmp(&(*b as f64 - fps).abs())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .unwrap_or(30);
                render.insert("fps".to_string(), json!(nearest));
                assumptions.push(format!("snapped render.fps from {fps} to {nearest}"));
            }
        }
    }
}

fn clamp_field(
    map: &mut Map<String, Value>,
    key: &str,
    min: f64,
    max: f64,
    path: &str,
    assumptions: &mut Vec<String>,
) {
    if let Some(n) = map.get(key).and_then(Value::as_f64) {
        if n < min || n > max {
            let clamped = n.clamp(min, max);
            map.insert(key.to_string(), json!(clamped));
            assumptions.push(format!("clamped {path} from {n} to {clamped}"));
        }
    }
}

// --- Strategy 3: coerce near-miss enum values ---

fn apply_enum_coercion(value: &mut Value, ctx: &RepairContext, assumptions: &mut Vec<String>) {
    let root = match value.as_object_mut() {
        Some(map) => map,
        None => return,
    };

    if let Some(style) = root.get("style").and_then(Value::as_str).map(str::to_string) {
        if !STYLES.contains(&style.as_str()) {
            let coerced = coerce_style(&style).unwrap_or_else(|| ctx.style.to_string());
            assumptions.push(format!("coerced style '{style}' to '{coerced}'"));
            root.insert("style".to_string(), json!(coerced));
        }
    }

    if let Some(env) = root.get_mut("environment").and_then(Value::as_object_mut) {
        coerce_enum_field(env, "preset", PRESETS, coerce_preset, "dusk", "environment.preset", assumptions);
        coerce_color_field(env, "skyColor", "#1a1a2e", "environment.skyColor", assumptions);
    }

    if let Some(structures) = root.get_mut("structures").and_then(Value::as_array_mut) {
        for (i, structure) in structures.iter_mut().enumerate() {
            if let Some(map) = structure.as_object_mut() {
                coerce_enum_field(
                    map,
                    "template",
                    TEMPLATES,
                    coerce_template,
                    "floating_island",
                    &format!("structures[{i}].template"),
                    assumptions,
                );
            }
        }
    }

    if let Some(entities) = root.get_mut("entities").and_then(Value::as_array_mut) {
        for (i, entity) in entities.iter_mut().enumerate() {
            if let Some(map) = entity.as_object_mut() {
                coerce_enum_field(
                    map,
                    "type",
                    ENTITY_TYPES,
                    coerce_entity_type,
                    "floating_orbs",
                    &format!("entities[{i}].type"),
                    assumptions,
                );
                if let Some(params) = map.get_mut("params").and_then(Value::as_object_mut) {
                    coerce_color_field(
                        params,
                        "color",
                        "#ffffff",
                        &format!("entities[{i}].params.color"),
                        assumptions,
                    );
                }
            }
        }
    }

    if let Some(cine) = root.get_mut("cinematography").and_then(Value::as_object_mut) {
        if let Some(shots) = cine.get_mut("shots").and_then(Value::as_array_mut) {
            for (i, shot) in shots.iter_mut().enumerate() {
                if let Some(map) = shot.as_object_mut() {
                    coerce_enum_field(
                        map,
                        "type",
                        SHOT_TYPES,
                        coerce_shot_type,
                        "orbital",
                        &format!("cinematography.shots[{i}].type"),
                        assumptions,
                    );
                }
            }
        }
    }

    if let Some(render) = root.get_mut("render").and_then(Value::as_object_mut) {
        coerce_enum_field(
            render,
            "quality",
            &["draft", "medium", "high"],
            coerce_render_quality,
            "medium",
            "render.quality",
            assumptions,
        );
    }

    if let Some(meta) = root.get_mut("metadata").and_then(Value::as_object_mut) {
        if let Some(source) = meta.get("source").and_then(Value::as_str) {
            if !crate::validator::SOURCES.contains(&source) {
                assumptions.push(format!("reset unknown metadata source '{source}'"));
                meta.insert("source".to_string(), json!("ai"));
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn coerce_enum_field(
    map: &mut Map<String, Value>,
    key: &str,
    allowed: &[&str],
    coerce: fn(&str) -> Option<&'static str>,
    fallback: &str,
    path: &str,
    assumptions: &mut Vec<String>,
) {
    if let Some(current) = map.get(key).and_then(Value::as_str).map(str::to_string) {
        if !allowed.contains(&current.as_str()) {
            let normalized = normalize_token(&current);
            let replacement = if allowed.contains(&normalized.as_str()) {
                normalized
            } else {
                coerce(&normalized).unwrap_or(fallback).to_string()
            };
            assumptions.push(format!("coerced {path} '{current}' to '{replacement}'"));
            map.insert(key.to_string(), json!(replacement));
        }
    }
}

fn coerce_color_field(
    map: &mut Map<String, Value>,
    key: &str,
    fallback: &str,
    path: &str,
    assumptions: &mut Vec<String>,
) {
    if let Some(current) = map.get(key).and_then(Value::as_str).map(str::to_string) {
        let valid = current.len() == 7
            && current.starts_with('#')
            && current[1..].chars().all(|c| c.is_ascii_hexdigit());
        if valid {
            return;
        }
        let replacement = coerce_color(&current).unwrap_or_else(|| fallback.to_string());
        assumptions.push(format!("coerced {path} '{current}' to '{replacement}'"));
        map.insert(key.to_string(), json!(replacement));
    }
}

fn normalize_token(token: &str) -> String {
    token.trim().to_ascii_lowercase().replace([' ', '-'], "_")
}

fn coerce_style(style: &str) -> Option<String> {
    let normalized = normalize_token(style);
    let mapped = match normalized.as_str() {
        "dreamy" | "soft" | "heavenly" | "airy" => "ethereal",
        "neon" | "futuristic" | "tech" | "scifi" | "sci_fi" => "cyberpunk",
        "weird" | "abstract" | "strange" | "odd" => "surreal",
        "magical" | "mythic" | "fairy" | "fairytale" => "fantasy",
        "dark" | "scary" | "horror" | "creepy" => "nightmare",
        _ => return None,
    };
    Some(mapped.to_string())
}

fn coerce_preset(preset: &str) -> Option<&'static str> {
    Some(match preset {
        "sunrise" | "morning" => "dawn",
        "sunset" | "evening" | "twilight" => "dusk",
        "midnight" | "dark" | "stars" => "night",
        "space" | "empty" | "abyss" => "void",
        "ocean" | "sea" | "deep" => "underwater",
        _ => return None,
    })
}

fn coerce_template(template: &str) -> Option<&'static str> {
    if template.contains("librar") || template.contains("book") {
        Some("floating_library")
    } else if template.contains("tower") || template.contains("spire") || template.contains("crystal") {
        Some("crystal_tower")
    } else if template.contains("house") || template.contains("home") || template.contains("build") {
        Some("twisted_house")
    } else if template.contains("portal") || template.contains("gate") || template.contains("door") {
        Some("portal")
    } else if template.contains("stair") || template.contains("steps") {
        Some("infinite_staircase")
    } else if template.contains("island") || template.contains("land") {
        Some("floating_island")
    } else {
        None
    }
}

fn coerce_entity_type(entity_type: &str) -> Option<&'static str> {
    if entity_type.contains("swarm") || entity_type.contains("particle") {
        Some("particle_swarm")
    } else if entity_type.contains("orb") || entity_type.contains("sphere") {
        Some("floating_orbs")
    } else if entity_type.contains("butterfl") || entity_type.contains("moth") {
        Some("light_butterflies")
    } else if entity_type.contains("shadow") || entity_type.contains("figure") {
        Some("shadow_figures")
    } else if entity_type.contains("memor") || entity_type.contains("fragment") {
        Some("memory_fragments")
    } else {
        None
    }
}

fn coerce_shot_type(shot_type: &str) -> Option<&'static str> {
    if shot_type.contains("orbit") || shot_type.contains("circle") {
        Some("orbital")
    } else if shot_type.contains("fly") || shot_type.contains("drone") || shot_type.contains("through") {
        Some("fly_through")
    } else if shot_type.contains("establish") || shot_type.contains("wide") || shot_type.contains("intro") {
        Some("establish")
    } else if shot_type.contains("close") || shot_type.contains("zoom_in") {
        Some("close_up")
    } else if shot_type.contains("pull") || shot_type.contains("zoom_out") || shot_type.contains("retreat") {
        Some("pullback")
    } else {
        None
    }
}

fn coerce_render_quality(quality: &str) -> Option<&'static str> {
    Some(match quality {
        "low" | "preview" | "fast" => "draft",
        "standard" | "normal" | "default" => "medium",
        "ultra" | "best" | "max" | "cinematic" => "high",
        _ => return None,
    })
}

fn coerce_color(color: &str) -> Option<String> {
    let trimmed = color.trim();
    // Expand shorthand #abc to #aabbcc
    if trimmed.len() == 4 && trimmed.starts_with('#') {
        let digits: Vec<char> = trimmed[1..].chars().collect();
        if digits.iter().all(|c| c.is_ascii_hexdigit()) {
            return Some(format!(
                "#{}{}{}{}{}{}",
                digits[0], digits[0], digits[1], digits[1], digits[2], digits[2]
            ));
        }
    }
    let named = match trimmed.to_ascii_lowercase().as_str() {
        "white" => "#ffffff",
        "black" => "#000000",
        "red" => "#ff4444",
        "blue" => "#4477ff",
        "green" => "#44ff88",
        "purple" | "violet" => "#aa66ff",
        "pink" => "#ff66cc",
        "gold" | "yellow" => "#ffd700",
        "cyan" | "teal" => "#00ffff",
        "orange" => "#ff8844",
        "silver" | "grey" | "gray" => "#c0c0c0",
        _ => return None,
    };
    Some(named.to_string())
}

// --- Strategy 4: drop over-limit entries ---

fn apply_structural_drop(value: &mut Value, assumptions: &mut Vec<String>) {
    let root = match value.as_object_mut() {
        Some(map) => map,
        None => return,
    };

    if let Some(structures) = root.get_mut("structures").and_then(Value::as_array_mut) {
        if structures.len() > MAX_STRUCTURES {
            let dropped = structures.len() - MAX_STRUCTURES;
            structures.truncate(MAX_STRUCTURES);
            assumptions.push(format!("dropped {dropped} structures over the limit"));
        }
    }

    if let Some(entities) = root.get_mut("entities").and_then(Value::as_array_mut) {
        if entities.len() > MAX_ENTITIES {
            let dropped = entities.len() - MAX_ENTITIES;
            entities.truncate(MAX_ENTITIES);
            assumptions.push(format!("dropped {dropped} entities over the limit"));
        }

        // Scale counts down proportionally when the total exceeds the cap
        let total: u64 = entities
            .iter()
            .filter_map(|e| e.get("count").and_then(Value::as_u64))
            .sum();
        if total > MAX_TOTAL_ENTITY_COUNT as u64 {
            let factor = MAX_TOTAL_ENTITY_COUNT as f64 / total as f64;
            for entity in entities.iter_mut() {
                if let Some(map) = entity.as_object_mut() {
                    if let Some(count) = map.get("count").and_then(Value::as_u64) {
                        let scaled = ((count as f64 * factor).floor() as u64).max(1);
                        map.insert("count".to_string(), json!(scaled));
                    }
                }
            }
            assumptions.push(format!(
                "scaled entity counts down from {total} to fit the {MAX_TOTAL_ENTITY_COUNT} cap"
            ));
        }
    }

    if let Some(shots) = root
        .get_mut("cinematography")
        .and_then(Value::as_object_mut)
        .and_then(|c| c.get_mut("shots"))
        .and_then(Value::as_array_mut)
    {
        if shots.len() > MAX_SHOTS {
            let dropped = shots.len() - MAX_SHOTS;
            shots.truncate(MAX_SHOTS);
            assumptions.push(format!("dropped {dropped} shots over the limit"));
        }
    }
}

// --- Strategy 5: reconcile shot durations with the total ---

fn reconcile_durations(value: &mut Value, assumptions: &mut Vec<String>) {
    let root = match value.as_object_mut() {
        Some(map) => map,
        None => return,
    };
    let cine = match root.get_mut("cinematography").and_then(Value::as_object_mut) {
        Some(cine) => cine,
        None => return,
    };

    let duration = match cine.get("durationSec").and_then(Value::as_f64) {
        Some(d) => d,
        None => return,
    };
    let shots = match cine.get_mut("shots").and_then(Value::as_array_mut) {
        Some(shots) if !shots.is_empty() => shots,
        _ => return,
    };

    let sum: f64 = shots
        .iter()
        .filter_map(|s| s.get("duration").and_then(Value::as_f64))
        .sum();
    if sum <= 0.0 || (sum - duration).abs() <= SHOT_SUM_TOLERANCE {
        return;
    }

    // Rescale every shot toward the declared total, respecting per-shot bounds
    let factor = duration / sum;
    for shot in shots.iter_mut() {
        if let Some(map) = shot.as_object_mut() {
            if let Some(d) = map.get("duration").and_then(Value::as_f64) {
                let scaled = ((d * factor) * 10.0).round() / 10.0;
                map.insert("duration".to_string(), json!(scaled.clamp(2.0, 60.0)));
            }
        }
    }

    let new_sum: f64 = shots
        .iter()
        .filter_map(|s| s.get("duration").and_then(Value::as_f64))
        .sum();
    if (new_sum - duration).abs() <= SHOT_SUM_TOLERANCE {
        assumptions.push(format!(
            "rescaled shot durations (sum {sum:.1}s) to match durationSec {duration:.1}s"
        ));
    } else {
        // Per-shot bounds blocked the rescale; move the total instead
        let adjusted = new_sum.clamp(10.0, 300.0);
        cine.insert("durationSec".to_string(), json!(adjusted));
        assumptions.push(format!(
            "recalculated durationSec from shots ({sum:.1}s → {adjusted:.1}s)"
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use dream_common::types::ArtifactSource;

    fn ctx() -> RepairContext {
        RepairContext {
            style: DreamStyle::Cyberpunk,
            title_hint: "A spaceship orbiting the earth".to_string(),
            requested_duration: Some(30.0),
            seed: None,
        }
    }

    fn minimal_scene() -> Value {
        json!({
            "title": "Orbiting ship",
            "style": "cyberpunk",
            "structures": [
                {"id": "ship", "template": "portal", "pos": [0.0, 50.0, 0.0], "scale": 3.0}
            ],
            "entities": [
                {"id": "stars", "type": "particle_swarm", "count": 100,
                 "params": {"speed": 0.5, "glow": 1.0, "size": 0.2, "color": "#ffffff"}}
            ],
            "cinematography": {
                "durationSec": 30.0,
                "shots": [{"type": "orbital", "duration": 30.0}]
            }
        })
    }

    #[test]
    fn fills_missing_bookkeeping_fields() {
        let result = RepairPipeline::default().run(minimal_scene(), &ctx());
        let artifact = result.artifact.expect("artifact");
        assert_matches!(result.verdict, RepairVerdict::Valid { repaired: true });
        assert!(!artifact.id.is_empty());
        assert_eq!(artifact.metadata.source, ArtifactSource::Ai);
        assert!(artifact.assumptions.is_some());
    }

    #[test]
    fn already_valid_artifact_is_untouched() {
        let value = crate::validator::valid_artifact_value();
        let result = RepairPipeline::default().run(value.clone(), &ctx());
        assert_eq!(result.verdict, RepairVerdict::Valid { repaired: false });
        let artifact = result.artifact.unwrap();
        assert_eq!(artifact.title, "A glass city at dusk");
        assert!(result.assumptions.is_empty());
    }

    #[test]
    fn clamps_out_of_range_values_with_assumptions() {
        let mut value = minimal_scene();
        value["environment"] = json!({"preset": "dusk", "fog": 3.0, "skyColor": "#101020", "ambientLight": 9.0});
        value["structures"][0]["scale"] = json!(99.0);
        let result = RepairPipeline::default().run(value, &ctx());
        let artifact = result.artifact.expect("artifact");
        assert!((artifact.environment.fog - 1.0).abs() < f64::EPSILON);
        assert!((artifact.environment.ambient_light - 3.0).abs() < f64::EPSILON);
        assert!((artifact.structures[0].scale - 10.0).abs() < f64::EPSILON);
        assert!(result.assumptions.iter().any(|a| a.contains("clamped")));
    }

    #[test]
    fn coerces_synonym_enums() {
        let mut value = minimal_scene();
        value["style"] = json!("dreamy");
        value["entities"][0]["type"] = json!("glowing orbs");
        let result = RepairPipeline::default().run(value, &ctx());
        let artifact = result.artifact.expect("artifact");
        assert_eq!(artifact.style, DreamStyle::Ethereal);
        assert!(result.assumptions.iter().any(|a| a.contains("coerced")));
    }

    #[test]
    fn drops_structures_over_the_limit() {
        let mut value = minimal_scene();
        let one = value["structures"][0].clone();
        value["structures"] = Value::Array((0..25).map(|_| one.clone()).collect());
        let result = RepairPipeline::default().run(value, &ctx());
        let artifact = result.artifact.expect("artifact");
        assert_eq!(artifact.structures.len(), MAX_STRUCTURES);
        assert!(result.assumptions.iter().any(|a| a.contains("dropped")));
    }

    #[test]
    fn scales_entity_counts_to_cap() {
        let mut value = minimal_scene();
        value["entities"] = json!([
            {"id": "a", "type": "particle_swarm", "count": 200,
             "params": {"speed": 1.0, "glow": 0.5, "size": 1.0, "color": "#ffffff"}},
            {"id": "b", "type": "floating_orbs", "count": 200,
             "params": {"speed": 1.0, "glow": 0.5, "size": 1.0, "color": "#ffffff"}},
            {"id": "c", "type": "shadow_figures", "count": 200,
             "params": {"speed": 1.0, "glow": 0.5, "size": 1.0, "color": "#ffffff"}}
        ]);
        let result = RepairPipeline::default().run(value, &ctx());
        let artifact = result.artifact.expect("artifact");
        assert!(artifact.total_entity_count() <= MAX_TOTAL_ENTITY_COUNT);
    }

    #[test]
    fn rescales_shot_durations_to_declared_total() {
        let mut value = minimal_scene();
        value["cinematography"] = json!({
            "durationSec": 30.0,
            "shots": [
                {"type": "establish", "duration": 10.0},
                {"type": "orbital", "duration": 10.0}
            ]
        });
        let result = RepairPipeline::default().run(value, &ctx());
        let artifact = result.artifact.expect("artifact");
        let sum = artifact.total_shot_duration();
        assert!(
            (sum - artifact.cinematography.duration_sec).abs() <= SHOT_SUM_TOLERANCE,
            "sum {sum} vs duration {}",
            artifact.cinematography.duration_sec
        );
        assert!(result.assumptions.iter().any(|a| a.contains("rescaled")));
    }

    #[test]
    fn empty_scene_requests_regeneration() {
        let value = json!({"title": "nothing here", "style": "surreal"});
        let result = RepairPipeline::default().run(value, &ctx());
        assert!(result.artifact.is_none());
        match result.verdict {
            RepairVerdict::NeedsRegeneration { missing, prompt_addendum } => {
                assert!(missing.contains(&"structures".to_string()));
                assert!(prompt_addendum.contains("structures"));
            }
            other => panic!("expected regeneration, got {other:?}"),
        }
    }

    #[test]
    fn non_object_requests_regeneration() {
        let result = RepairPipeline::default().run(json!([1, 2, 3]), &ctx());
        assert!(result.artifact.is_none());
        assert_matches!(result.verdict, RepairVerdict::NeedsRegeneration { .. });
    }

    #[test]
    fn repaired_flag_drives_provenance_decision() {
        let valid = crate::validator::valid_artifact_value();
        let untouched = RepairPipeline::default().run(valid, &ctx());
        assert_eq!(untouched.verdict, RepairVerdict::Valid { repaired: false });

        let touched = RepairPipeline::default().run(minimal_scene(), &ctx());
        assert_eq!(touched.verdict, RepairVerdict::Valid { repaired: true });
    }

    #[test]
    fn missing_duration_is_recalculated_from_shots() {
        let mut value = minimal_scene();
        value["cinematography"] = json!({
            "shots": [
                {"type": "establish", "duration": 12.0},
                {"type": "pullback", "duration": 8.0}
            ]
        });
        let result = RepairPipeline::default().run(value, &ctx());
        let artifact = result.artifact.expect("artifact");
        assert!((artifact.cinematography.duration_sec - 20.0).abs() <= SHOT_SUM_TOLERANCE);
        assert!(result.assumptions.iter().any(|a| a.contains("durationSec")));
    }
}
