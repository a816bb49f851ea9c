use crate::engine::condition::{parse_predicate, Predicate};
use crate::engine::types::{Direction, ScenarioKind};
use crate::error::CoreError;
use crate::events::Timeframe;
use crate::market::mtf::TrendDirection;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

/// `if` keys that carry score weight plus the advisory blocks real
/// libraries include. Anything else fails the load.
const ADVISORY_KEYS: [&str; 5] = [
    "trend_strength",
    "volume_analysis",
    "confidence_threshold",
    "mtf_alignment",
    "metrics",
];

const WEIGHTED_KEYS: [&str; 6] = ["mtf", "exocharts", "cvd", "clusters", "news", "triggers"];

// ============================================================================
// Cooked scenario model
// ============================================================================

/// SL/TP placement, either as percentages of entry or as ATR multiples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tactics {
    Percent { tp1: f64, tp2: f64, tp3: f64, sl: f64 },
    Atr { tp1: f64, tp2: f64, tp3: f64, sl: f64 },
}

impl Default for Tactics {
    fn default() -> Self {
        Tactics::Percent {
            tp1: 2.0,
            tp2: 4.0,
            tp3: 6.0,
            sl: 1.5,
        }
    }
}

/// A category's predicates: an all-must-pass list, or OR-groups where each
/// group counts once any member passes.
#[derive(Debug, Clone)]
pub enum CategoryBody {
    AllOf(Vec<Predicate>),
    AnyGroup(Vec<Vec<Predicate>>),
}

#[derive(Debug, Clone)]
pub struct ConditionCategory {
    pub key: String,
    pub body: CategoryBody,
}

/// One rule from the declarative library, predicates pre-compiled.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    pub direction: Direction,
    pub kind: ScenarioKind,
    pub type_label: String,
    pub advanced: bool,
    pub opinion: Option<TrendDirection>,
    /// Hard gate: every required trend must match the cached frame exactly
    /// or the scenario is out for that cycle.
    pub required_trends: Vec<(Timeframe, TrendDirection)>,
    pub categories: Vec<ConditionCategory>,
    pub tactics: Tactics,
}

// ============================================================================
// Raw file shapes
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawScenario {
    id: String,
    #[serde(default)]
    name: Option<String>,
    direction: Direction,
    #[serde(rename = "type", default)]
    type_label: Option<String>,
    #[serde(default)]
    advanced: bool,
    #[serde(default)]
    opinion: Option<String>,
    #[serde(rename = "if", default)]
    conditions: serde_json::Map<String, Value>,
    #[serde(default)]
    tactics: RawTactics,
    #[serde(default)]
    mtf_trends: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTactics {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    tp1_percent: Option<f64>,
    #[serde(default)]
    tp2_percent: Option<f64>,
    #[serde(default)]
    tp3_percent: Option<f64>,
    #[serde(default)]
    sl_percent: Option<f64>,
    #[serde(default)]
    tp1_atr: Option<f64>,
    #[serde(default)]
    tp2_atr: Option<f64>,
    #[serde(default)]
    tp3_atr: Option<f64>,
    #[serde(default)]
    sl_atr: Option<f64>,
}

// ============================================================================
// Library
// ============================================================================

/// All loaded scenarios, IDs unique across files.
#[derive(Debug, Clone, Default)]
pub struct ScenarioLibrary {
    scenarios: Vec<Scenario>,
}

impl ScenarioLibrary {
    /// Loads and merges every file. Any malformed file, predicate, or
    /// unresolvable ID collision refuses startup.
    pub fn load(paths: &[String]) -> Result<ScenarioLibrary, CoreError> {
        let mut merged: Vec<Scenario> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for path in paths {
            let text = std::fs::read_to_string(path).map_err(|e| lib_err(path, format!("read failed: {e}")))?;
            for mut scenario in parse_file(path, &text)? {
                if !seen.insert(scenario.id.clone()) {
                    let renamed = format!("{}_V2", scenario.id);
                    if !seen.insert(renamed.clone()) {
                        return Err(lib_err(
                            path,
                            format!("duplicate scenario id {:?} and {:?} already taken", scenario.id, renamed),
                        ));
                    }
                    tracing::warn!(old = %scenario.id, new = %renamed, "scenario id collision, renamed");
                    scenario.id = renamed;
                }
                merged.push(scenario);
            }
        }

        if merged.is_empty() {
            let joined = paths.join(", ");
            return Err(lib_err(&joined, "no scenarios loaded".to_string()));
        }

        tracing::info!(scenarios = merged.len(), files = paths.len(), "scenario library loaded");
        Ok(ScenarioLibrary { scenarios: merged })
    }

    /// Builds a library from already-cooked scenarios. Used by tests and
    /// for the synthetic fallback set.
    pub fn from_scenarios(scenarios: Vec<Scenario>) -> ScenarioLibrary {
        ScenarioLibrary { scenarios }
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub fn get(&self, id: &str) -> Option<&Scenario> {
        self.scenarios.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

fn lib_err(path: &str, reason: String) -> CoreError {
    CoreError::ScenarioLibrary {
        path: path.to_string(),
        reason,
    }
}

/// Accepts either `{ "scenarios": [...] }` or a bare array.
fn parse_file(path: &str, text: &str) -> Result<Vec<Scenario>, CoreError> {
    let root: Value = serde_json::from_str(text).map_err(|e| lib_err(path, format!("invalid JSON: {e}")))?;
    let items = match &root {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("scenarios") {
            Some(Value::Array(items)) => items.as_slice(),
            Some(_) => return Err(lib_err(path, "\"scenarios\" is not an array".to_string())),
            None => return Err(lib_err(path, "expected a scenario array or a \"scenarios\" key".to_string())),
        },
        _ => return Err(lib_err(path, "expected a scenario array or object".to_string())),
    };

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let raw: RawScenario = serde_json::from_value(item.clone())
            .map_err(|e| lib_err(path, format!("bad scenario record: {e}")))?;
        out.push(cook(path, raw)?);
    }
    Ok(out)
}

fn cook(path: &str, raw: RawScenario) -> Result<Scenario, CoreError> {
    let id = raw.id;
    let type_label = raw.type_label.unwrap_or_default();
    let kind = ScenarioKind::from_type_str(&type_label);

    let opinion = match raw.opinion.as_deref() {
        None => None,
        Some(text) => Some(parse_trend(text).ok_or_else(|| {
            lib_err(path, format!("scenario {id:?}: unknown opinion {text:?}"))
        })?),
    };

    let mut required_trends = Vec::new();
    if let Some(map) = raw.mtf_trends {
        for (tf_key, trend_value) in map {
            let tf = Timeframe::parse(&tf_key).ok_or_else(|| {
                lib_err(path, format!("scenario {id:?}: unknown mtf_trends timeframe {tf_key:?}"))
            })?;
            let trend_text = trend_value.as_str().ok_or_else(|| {
                lib_err(path, format!("scenario {id:?}: mtf_trends[{tf_key:?}] is not a string"))
            })?;
            let trend = parse_trend(trend_text).ok_or_else(|| {
                lib_err(path, format!("scenario {id:?}: unknown trend {trend_text:?}"))
            })?;
            required_trends.push((tf, trend));
        }
    }

    let mut categories = Vec::new();
    for (key, value) in raw.conditions {
        let weighted = WEIGHTED_KEYS.contains(&key.as_str());
        if !weighted && !ADVISORY_KEYS.contains(&key.as_str()) {
            return Err(lib_err(path, format!("scenario {id:?}: unknown condition category {key:?}")));
        }
        match value {
            Value::Array(items) => {
                let body = cook_category(path, &id, &key, items)?;
                categories.push(ConditionCategory { key, body });
            }
            // Advisory blocks in the wild carry scalars and objects the
            // score never reads.
            _ if !weighted => {
                tracing::debug!(scenario = %id, category = %key, "ignoring non-list advisory category");
            }
            _ => {
                return Err(lib_err(path, format!("scenario {id:?}: category {key:?} must be a list")));
            }
        }
    }

    Ok(Scenario {
        name: raw.name.unwrap_or_else(|| id.clone()),
        id,
        direction: raw.direction,
        kind,
        type_label,
        advanced: raw.advanced,
        opinion,
        required_trends,
        categories,
        tactics: cook_tactics(path, raw.tactics)?,
    })
}

/// A list of strings is an all-must-pass set; once any element is itself a
/// list, the whole value is OR-groups and bare strings become
/// single-member groups.
fn cook_category(path: &str, id: &str, key: &str, items: Vec<Value>) -> Result<CategoryBody, CoreError> {
    let grouped = items.iter().any(|v| v.is_array());
    if !grouped {
        let mut predicates = Vec::with_capacity(items.len());
        for item in items {
            predicates.push(cook_predicate(path, id, key, &item)?);
        }
        return Ok(CategoryBody::AllOf(predicates));
    }

    let mut groups = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Array(members) => {
                let mut group = Vec::with_capacity(members.len());
                for member in members {
                    group.push(cook_predicate(path, id, key, &member)?);
                }
                groups.push(group);
            }
            other => groups.push(vec![cook_predicate(path, id, key, &other)?]),
        }
    }
    Ok(CategoryBody::AnyGroup(groups))
}

fn cook_predicate(path: &str, id: &str, key: &str, value: &Value) -> Result<Predicate, CoreError> {
    let text = value.as_str().ok_or_else(|| {
        lib_err(path, format!("scenario {id:?}: category {key:?} holds a non-string predicate"))
    })?;
    parse_predicate(text).map_err(|e| {
        lib_err(path, format!("scenario {id:?}: predicate {text:?}: {e}"))
    })
}

fn cook_tactics(path: &str, raw: RawTactics) -> Result<Tactics, CoreError> {
    let atr_requested = raw.tp1_atr.is_some()
        || raw.tp2_atr.is_some()
        || raw.tp3_atr.is_some()
        || raw.sl_atr.is_some();

    let tactics = match raw.mode.as_deref() {
        Some("atr") => Tactics::Atr {
            tp1: raw.tp1_atr.unwrap_or(1.0),
            tp2: raw.tp2_atr.unwrap_or(2.0),
            tp3: raw.tp3_atr.unwrap_or(3.0),
            sl: raw.sl_atr.unwrap_or(1.5),
        },
        Some("percent") => Tactics::Percent {
            tp1: raw.tp1_percent.unwrap_or(2.0),
            tp2: raw.tp2_percent.unwrap_or(4.0),
            tp3: raw.tp3_percent.unwrap_or(6.0),
            sl: raw.sl_percent.unwrap_or(1.5),
        },
        Some(other) => {
            return Err(lib_err(path, format!("unknown tactics mode {other:?}")));
        }
        None if atr_requested => Tactics::Atr {
            tp1: raw.tp1_atr.unwrap_or(1.0),
            tp2: raw.tp2_atr.unwrap_or(2.0),
            tp3: raw.tp3_atr.unwrap_or(3.0),
            sl: raw.sl_atr.unwrap_or(1.5),
        },
        None => Tactics::Percent {
            tp1: raw.tp1_percent.unwrap_or(2.0),
            tp2: raw.tp2_percent.unwrap_or(4.0),
            tp3: raw.tp3_percent.unwrap_or(6.0),
            sl: raw.sl_percent.unwrap_or(1.5),
        },
    };

    let (tp1, tp2, tp3, sl) = match tactics {
        Tactics::Percent { tp1, tp2, tp3, sl } | Tactics::Atr { tp1, tp2, tp3, sl } => (tp1, tp2, tp3, sl),
    };
    let all_finite = [tp1, tp2, tp3, sl].iter().all(|v| v.is_finite() && *v > 0.0);
    if !all_finite {
        return Err(lib_err(path, "tactics values must be finite and positive".to_string()));
    }
    if !(tp1 <= tp2 && tp2 <= tp3) {
        return Err(lib_err(path, "tactics targets must be ordered tp1 <= tp2 <= tp3".to_string()));
    }
    Ok(tactics)
}

fn parse_trend(text: &str) -> Option<TrendDirection> {
    match text.trim().to_ascii_uppercase().as_str() {
        "BULLISH" => Some(TrendDirection::Bullish),
        "BEARISH" => Some(TrendDirection::Bearish),
        "NEUTRAL" => Some(TrendDirection::Neutral),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct TempLibraryFile {
        path: PathBuf,
    }

    impl TempLibraryFile {
        fn new(name: &str, contents: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "signalgen_lib_{}_{}.json",
                std::process::id(),
                name
            ));
            std::fs::write(&path, contents).unwrap();
            TempLibraryFile { path }
        }

        fn path_string(&self) -> String {
            self.path.to_string_lossy().into_owned()
        }
    }

    impl Drop for TempLibraryFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    const BASIC: &str = r#"{
        "scenarios": [
            {
                "id": "MOMO_LONG",
                "name": "Momentum continuation",
                "direction": "LONG",
                "type": "MOMENTUM-LONG",
                "advanced": true,
                "opinion": "bullish",
                "if": {
                    "mtf": ["trend_1h == BULLISH", "trend_4h == BULLISH"],
                    "clusters": [["cluster.stacked_imbalance_up"], ["cluster.absorption_low"]],
                    "trend_strength": ["adx_1h > 20"]
                },
                "tactics": { "tp1_percent": 1.5, "tp2_percent": 3.0, "tp3_percent": 5.0, "sl_percent": 1.0 },
                "mtf_trends": { "4h": "BULLISH" }
            }
        ]
    }"#;

    const BARE: &str = r#"[
        {
            "id": "RANGE_FADE",
            "direction": "SHORT",
            "type": "MEAN_REVERSION",
            "if": { "cvd": ["cvd_percent < -1"] },
            "tactics": { "mode": "atr", "sl_atr": 2.0 }
        }
    ]"#;

    #[test]
    fn test_load_object_wrapper_and_bare_array() {
        let a = TempLibraryFile::new("wrapped", BASIC);
        let b = TempLibraryFile::new("bare", BARE);
        let lib = ScenarioLibrary::load(&[a.path_string(), b.path_string()]).unwrap();
        assert_eq!(lib.len(), 2);

        let momo = lib.get("MOMO_LONG").unwrap();
        assert_eq!(momo.name, "Momentum continuation");
        assert_eq!(momo.direction, Direction::Long);
        assert_eq!(momo.kind, ScenarioKind::Momentum);
        assert!(momo.advanced);
        assert_eq!(momo.opinion, Some(TrendDirection::Bullish));
        assert_eq!(momo.required_trends, vec![(Timeframe::H4, TrendDirection::Bullish)]);
        assert_eq!(momo.categories.len(), 3);
        assert!(matches!(
            momo.tactics,
            Tactics::Percent { tp1, sl, .. } if tp1 == 1.5 && sl == 1.0
        ));

        let fade = lib.get("RANGE_FADE").unwrap();
        assert_eq!(fade.kind, ScenarioKind::MeanReversion);
        assert_eq!(fade.name, "RANGE_FADE");
        assert!(matches!(
            fade.tactics,
            Tactics::Atr { tp1, tp2, tp3, sl } if tp1 == 1.0 && tp2 == 2.0 && tp3 == 3.0 && sl == 2.0
        ));
    }

    #[test]
    fn test_category_shapes() {
        let file = TempLibraryFile::new("shapes", BASIC);
        let lib = ScenarioLibrary::load(&[file.path_string()]).unwrap();
        let momo = lib.get("MOMO_LONG").unwrap();

        let mtf = momo.categories.iter().find(|c| c.key == "mtf").unwrap();
        assert!(matches!(&mtf.body, CategoryBody::AllOf(p) if p.len() == 2));

        let clusters = momo.categories.iter().find(|c| c.key == "clusters").unwrap();
        assert!(matches!(&clusters.body, CategoryBody::AnyGroup(g) if g.len() == 2));
    }

    #[test]
    fn test_duplicate_id_renamed_once_then_rejected() {
        let a = TempLibraryFile::new("dup_a", BARE);
        let b = TempLibraryFile::new("dup_b", BARE);
        let lib = ScenarioLibrary::load(&[a.path_string(), b.path_string()]).unwrap();
        assert_eq!(lib.len(), 2);
        assert!(lib.get("RANGE_FADE").is_some());
        assert!(lib.get("RANGE_FADE_V2").is_some());

        let c = TempLibraryFile::new("dup_c", BARE);
        let err = ScenarioLibrary::load(&[a.path_string(), b.path_string(), c.path_string()]);
        assert!(err.is_err());
    }

    #[test]
    fn test_bad_predicate_refuses_load() {
        let file = TempLibraryFile::new(
            "badpred",
            r#"[{ "id": "X", "direction": "LONG", "if": { "cvd": ["cvd_percent >"] } }]"#,
        );
        let err = ScenarioLibrary::load(&[file.path_string()]).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("predicate"));
    }

    #[test]
    fn test_unknown_category_key_refuses_load() {
        let file = TempLibraryFile::new(
            "badkey",
            r#"[{ "id": "X", "direction": "LONG", "if": { "astrology": ["price > 0"] } }]"#,
        );
        assert!(ScenarioLibrary::load(&[file.path_string()]).is_err());
    }

    #[test]
    fn test_advisory_scalar_ignored() {
        let file = TempLibraryFile::new(
            "advisory",
            r#"[{ "id": "X", "direction": "LONG", "if": { "confidence_threshold": 0.7, "cvd": ["cvd_value > 0"] } }]"#,
        );
        let lib = ScenarioLibrary::load(&[file.path_string()]).unwrap();
        let s = lib.get("X").unwrap();
        assert_eq!(s.categories.len(), 1);
        assert_eq!(s.categories[0].key, "cvd");
    }

    #[test]
    fn test_empty_library_is_fatal() {
        let file = TempLibraryFile::new("empty", "[]");
        let err = ScenarioLibrary::load(&[file.path_string()]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let err = ScenarioLibrary::load(&["/nonexistent/scenarios.json".to_string()]).unwrap_err();
        assert!(matches!(err, CoreError::ScenarioLibrary { .. }));
    }

    #[test]
    fn test_unordered_targets_rejected() {
        let file = TempLibraryFile::new(
            "unordered",
            r#"[{ "id": "X", "direction": "LONG", "tactics": { "tp1_percent": 5.0, "tp2_percent": 2.0 } }]"#,
        );
        assert!(ScenarioLibrary::load(&[file.path_string()]).is_err());
    }

    #[test]
    fn test_default_tactics() {
        let file = TempLibraryFile::new(
            "defaults",
            r#"[{ "id": "X", "direction": "SHORT" }]"#,
        );
        let lib = ScenarioLibrary::load(&[file.path_string()]).unwrap();
        assert_eq!(lib.get("X").unwrap().tactics, Tactics::default());
        match Tactics::default() {
            Tactics::Percent { tp1, tp2, tp3, sl } => {
                assert_eq!((tp1, tp2, tp3, sl), (2.0, 4.0, 6.0, 1.5));
            }
            Tactics::Atr { .. } => panic!("default tactics must be percent mode"),
        }
    }
}
