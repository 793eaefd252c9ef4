use serde_json::{Map, Value, json};

use crate::document;
use crate::error::{Error, Result};
use crate::store;

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Equality left-outer join against another collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupStage {
    pub from: String,
    pub local_field: String,
    pub foreign_field: String,
    pub as_field: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Lookup(LookupStage),
    /// Replace the named collection with the pipeline's result.
    Out { to: String },
}

impl Stage {
    pub fn lookup(from: &str, local_field: &str, foreign_field: &str, as_field: &str) -> Self {
        Stage::Lookup(LookupStage {
            from: from.to_string(),
            local_field: local_field.to_string(),
            foreign_field: foreign_field.to_string(),
            as_field: as_field.to_string(),
        })
    }

    pub fn out(to: &str) -> Self {
        Stage::Out { to: to.to_string() }
    }

    /// Stage kind as written in a pipeline definition.
    pub fn kind(&self) -> &'static str {
        match self {
            Stage::Lookup(_) => "$lookup",
            Stage::Out { .. } => "$out",
        }
    }

    /// The collection the stage reads from or writes to.
    pub fn collection(&self) -> &str {
        match self {
            Stage::Lookup(l) => &l.from,
            Stage::Out { to } => to,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Stage::Lookup(l) => json!({"$lookup": {
                "from": l.from,
                "localField": l.local_field,
                "foreignField": l.foreign_field,
                "as": l.as_field,
            }}),
            Stage::Out { to } => json!({"$out": to}),
        }
    }

    fn validate(&self, index: usize) -> Result<()> {
        let stage = Some(index);
        match self {
            Stage::Lookup(l) => {
                store::validate_name(&l.from).map_err(|_| {
                    Error::invalid(
                        stage,
                        format!("$lookup 'from' is not a valid collection name: {:?}", l.from),
                    )
                })?;
                for (name, path) in [
                    ("localField", &l.local_field),
                    ("foreignField", &l.foreign_field),
                    ("as", &l.as_field),
                ] {
                    document::validate_path(path).map_err(|reason| {
                        Error::invalid(stage, format!("$lookup '{name}': {reason}"))
                    })?;
                }
            }
            Stage::Out { to } => {
                store::validate_name(to).map_err(|_| {
                    Error::invalid(
                        stage,
                        format!("$out target is not a valid collection name: {to:?}"),
                    )
                })?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A validated, ordered sequence of stages.
///
/// At most one `$out` stage may appear and it must be last. A pipeline
/// without `$out` runs as a preview and persists nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        let mut outs = stages
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Stage::Out { .. }));
        if let Some((second, _)) = outs.nth(1) {
            return Err(Error::invalid(
                Some(second),
                "pipeline may contain at most one $out stage",
            ));
        }

        let last = stages.len().saturating_sub(1);
        for (i, stage) in stages.iter().enumerate() {
            stage.validate(i)?;
            if let Stage::Out { .. } = stage {
                if i != last {
                    return Err(Error::invalid(
                        Some(i),
                        "$out must be the last stage in the pipeline",
                    ));
                }
            }
        }
        Ok(Self { stages })
    }

    /// Parse a pipeline definition: an array of single-key stage objects.
    ///
    /// ```text
    /// [{"$lookup": {"from": "b", "localField": "k", "foreignField": "k", "as": "bs"}},
    ///  {"$out": "joined"}]
    /// ```
    pub fn parse(pipeline_json: &Value) -> Result<Self> {
        let arr = pipeline_json
            .as_array()
            .ok_or_else(|| Error::invalid(None, "pipeline must be an array"))?;

        let mut stages = Vec::with_capacity(arr.len());
        for (i, stage_val) in arr.iter().enumerate() {
            stages.push(parse_stage(i, stage_val)?);
        }
        Self::new(stages)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Destination collection of the terminal `$out` stage, if any.
    pub fn output(&self) -> Option<&str> {
        match self.stages.last() {
            Some(Stage::Out { to }) => Some(to),
            _ => None,
        }
    }

    /// Lookup stages paired with their positions, in execution order.
    pub fn lookups(&self) -> impl Iterator<Item = (usize, &LookupStage)> {
        self.stages.iter().enumerate().filter_map(|(i, s)| match s {
            Stage::Lookup(l) => Some((i, l)),
            Stage::Out { .. } => None,
        })
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.stages.iter().map(Stage::to_json).collect())
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_stage(i: usize, stage_val: &Value) -> Result<Stage> {
    let stage = Some(i);
    let obj = stage_val
        .as_object()
        .ok_or_else(|| Error::invalid(stage, "each pipeline stage must be an object"))?;
    if obj.len() != 1 {
        return Err(Error::invalid(stage, "each pipeline stage must have exactly one key"));
    }
    let Some((stage_name, stage_body)) = obj.iter().next() else {
        return Err(Error::invalid(stage, "empty pipeline stage"));
    };

    match stage_name.trim_start_matches('$') {
        "lookup" => parse_lookup(i, stage_body),
        "out" => parse_out(i, stage_body),
        _ => Err(Error::invalid(stage, format!("unknown stage: {stage_name}"))),
    }
}

fn parse_lookup(i: usize, body: &Value) -> Result<Stage> {
    let stage = Some(i);
    let obj = body
        .as_object()
        .ok_or_else(|| Error::invalid(stage, "$lookup must be an object"))?;
    if let Some(key) = obj
        .keys()
        .find(|k| !matches!(k.as_str(), "from" | "localField" | "foreignField" | "as"))
    {
        return Err(Error::invalid(
            stage,
            format!("$lookup option '{key}' is not supported"),
        ));
    }
    let field = |name: &str| -> Result<String> {
        required_string(obj, name)
            .ok_or_else(|| Error::invalid(stage, format!("$lookup requires '{name}' string")))
    };
    Ok(Stage::Lookup(LookupStage {
        from: field("from")?,
        local_field: field("localField")?,
        foreign_field: field("foreignField")?,
        as_field: field("as")?,
    }))
}

fn parse_out(i: usize, body: &Value) -> Result<Stage> {
    let stage = Some(i);
    match body {
        Value::String(to) => Ok(Stage::out(to)),
        Value::Object(obj) => {
            if obj.contains_key("db") {
                return Err(Error::invalid(
                    stage,
                    "$out into another database is not supported",
                ));
            }
            required_string(obj, "coll")
                .or_else(|| required_string(obj, "to"))
                .map(|to| Stage::Out { to })
                .ok_or_else(|| Error::invalid(stage, "$out requires a collection name"))
        }
        _ => Err(Error::invalid(stage, "$out must be a string or an object")),
    }
}

fn required_string(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comics_pipeline() -> Value {
        json!([
            {"$lookup": {
                "from": "charactersToComics",
                "localField": "comicID",
                "foreignField": "comicID",
                "as": "characters"
            }},
            {"$lookup": {
                "from": "characters",
                "localField": "characters.characterID",
                "foreignField": "characterID",
                "as": "characters"
            }},
            {"$out": "comics_and_characters"}
        ])
    }

    fn invalid_at(result: Result<Pipeline>) -> Option<usize> {
        match result {
            Err(Error::InvalidPipeline { stage, .. }) => stage,
            other => panic!("expected InvalidPipeline, got {other:?}"),
        }
    }

    #[test]
    fn parse_sample_pipeline() {
        let p = Pipeline::parse(&comics_pipeline()).unwrap();
        assert_eq!(p.len(), 3);
        assert_eq!(p.output(), Some("comics_and_characters"));
        assert_eq!(
            p.stages()[1],
            Stage::lookup("characters", "characters.characterID", "characterID", "characters")
        );
        let lookups: Vec<usize> = p.lookups().map(|(i, _)| i).collect();
        assert_eq!(lookups, vec![0, 1]);
    }

    #[test]
    fn to_json_parses_back() {
        let p = Pipeline::parse(&comics_pipeline()).unwrap();
        assert_eq!(Pipeline::parse(&p.to_json()).unwrap(), p);
    }

    #[test]
    fn parse_empty_pipeline() {
        let p = Pipeline::parse(&json!([])).unwrap();
        assert!(p.is_empty());
        assert_eq!(p.output(), None);
    }

    #[test]
    fn parse_out_forms() {
        let p = Pipeline::parse(&json!([{"$out": {"coll": "x"}}])).unwrap();
        assert_eq!(p.output(), Some("x"));
        let p = Pipeline::parse(&json!([{"out": {"to": "y"}}])).unwrap();
        assert_eq!(p.output(), Some("y"));
        let cross_db = json!([{"$out": {"db": "d", "coll": "x"}}]);
        assert_eq!(invalid_at(Pipeline::parse(&cross_db)), Some(0));
        assert_eq!(invalid_at(Pipeline::parse(&json!([{"$out": 3}]))), Some(0));
        assert_eq!(invalid_at(Pipeline::parse(&json!([{"$out": ""}]))), Some(0));
    }

    #[test]
    fn out_must_be_last() {
        let def = json!([
            {"$out": "x"},
            {"$lookup": {"from": "a", "localField": "k", "foreignField": "k", "as": "as"}}
        ]);
        assert_eq!(invalid_at(Pipeline::parse(&def)), Some(0));
    }

    #[test]
    fn at_most_one_out() {
        let stages = vec![Stage::out("x"), Stage::out("y")];
        assert_eq!(invalid_at(Pipeline::new(stages)), Some(1));
    }

    #[test]
    fn lookup_requires_all_fields() {
        let def = json!([{"$lookup": {"from": "a", "localField": "k", "as": "x"}}]);
        match Pipeline::parse(&def) {
            Err(Error::InvalidPipeline { stage: Some(0), reason }) => {
                assert!(reason.contains("foreignField"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn lookup_rejects_unsupported_options() {
        let def = json!([{"$lookup": {
            "from": "a", "localField": "k", "foreignField": "k", "as": "x",
            "pipeline": []
        }}]);
        assert_eq!(invalid_at(Pipeline::parse(&def)), Some(0));
    }

    #[test]
    fn lookup_rejects_bad_paths() {
        let stages = vec![Stage::lookup("a", "k..j", "k", "x")];
        assert_eq!(invalid_at(Pipeline::new(stages)), Some(0));
        let stages = vec![Stage::lookup("a", "k", "k", "$x")];
        assert_eq!(invalid_at(Pipeline::new(stages)), Some(0));
        let stages = vec![Stage::lookup("", "k", "k", "x")];
        assert_eq!(invalid_at(Pipeline::new(stages)), Some(0));
    }

    #[test]
    fn structural_errors() {
        assert_eq!(invalid_at(Pipeline::parse(&json!({"$out": "x"}))), None);
        assert_eq!(invalid_at(Pipeline::parse(&json!([1]))), Some(0));
        assert_eq!(invalid_at(Pipeline::parse(&json!([{}]))), Some(0));
        assert_eq!(
            invalid_at(Pipeline::parse(&json!([{"$out": "a", "$lookup": {}}]))),
            Some(0)
        );
        assert_eq!(invalid_at(Pipeline::parse(&json!([{"$group": {}}]))), Some(0));
    }

    #[test]
    fn stage_kind_and_collection() {
        let s = Stage::lookup("b", "k", "k", "bs");
        assert_eq!((s.kind(), s.collection()), ("$lookup", "b"));
        let s = Stage::out("o");
        assert_eq!((s.kind(), s.collection()), ("$out", "o"));
    }
}
