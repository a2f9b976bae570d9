//! In-process evaluation of filters, projections and aggregation pipelines.
//!
//! Backends without a native query engine (the in-memory and embedded SQLite
//! stores) load documents and run them through this module, so the query
//! catalogue can issue one dialect regardless of where documents live.
//!
//! Supported subset:
//!
//! | Kind | Operators |
//! |------|-----------|
//! | Filter | field equality, `$eq $ne $gt $gte $lt $lte $in $nin $exists $type`, `$and $or $expr` |
//! | Stage | `$match $project $addFields $group $sort $skip $limit $sample $facet $count` |
//! | Accumulator | `$sum $avg $first $min $max $push` |
//! | Expression | field paths, `$literal $toDate $subtract $eq $ne $year $month $dayOfMonth $hour $minute $dayOfWeek` |
//!
//! Anything else is rejected with [`Error::Query`].

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use bson::{Bson, DateTime as BsonDateTime, Document};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use rand::seq::SliceRandom;

use crate::error::{Error, Result};

/// Run a full aggregation pipeline over `docs`.
pub fn run_pipeline(mut docs: Vec<Document>, pipeline: &[Document]) -> Result<Vec<Document>> {
    for stage in pipeline {
        docs = apply_stage(docs, stage)?;
    }
    Ok(docs)
}

/// Whether `stage` transforms or drops documents one at a time, so it can run
/// while documents are still being read.
pub fn is_per_document(stage: &Document) -> bool {
    stage.len() == 1
        && stage
            .keys()
            .all(|name| matches!(name.as_str(), "$match" | "$project" | "$addFields" | "$set"))
}

/// Run per-document stages over one document. `None` when a `$match` drops it.
pub fn apply_per_document(doc: Document, stages: &[Document]) -> Result<Option<Document>> {
    let mut docs = vec![doc];
    for stage in stages {
        docs = apply_stage(docs, stage)?;
        if docs.is_empty() {
            return Ok(None);
        }
    }
    Ok(docs.pop())
}

fn apply_stage(docs: Vec<Document>, stage: &Document) -> Result<Vec<Document>> {
    let mut entries = stage.iter();
    let (name, spec) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => {
            return Err(Error::Query(format!(
                "pipeline stage must have exactly one key: {}",
                stage
            )))
        }
    };

    match name.as_str() {
        "$match" => {
            let filter = as_document(name, spec)?;
            let mut kept = Vec::with_capacity(docs.len());
            for doc in docs {
                if matches(&doc, filter)? {
                    kept.push(doc);
                }
            }
            Ok(kept)
        }
        "$project" => {
            let spec = as_document(name, spec)?;
            docs.iter().map(|doc| project(doc, spec)).collect()
        }
        "$addFields" | "$set" => {
            let spec = as_document(name, spec)?;
            docs.into_iter()
                .map(|mut doc| {
                    for (field, expr) in spec {
                        let value = evaluate(expr, &doc)?;
                        doc.insert(field.clone(), value);
                    }
                    Ok(doc)
                })
                .collect()
        }
        "$group" => group(docs, as_document(name, spec)?),
        "$sort" => {
            let spec = as_document(name, spec)?;
            sort(docs, spec)
        }
        "$skip" => {
            let n = as_count(name, spec)?;
            Ok(docs.into_iter().skip(n).collect())
        }
        "$limit" => {
            let n = as_count(name, spec)?;
            Ok(docs.into_iter().take(n).collect())
        }
        "$sample" => {
            let spec = as_document(name, spec)?;
            let size = spec
                .get("size")
                .ok_or_else(|| Error::Query("$sample requires a size".to_string()))
                .and_then(|size| as_count("$sample.size", size))?;
            let mut docs = docs;
            docs.shuffle(&mut rand::rng());
            docs.truncate(size);
            Ok(docs)
        }
        "$facet" => {
            let spec = as_document(name, spec)?;
            let mut out = Document::new();
            for (facet, stages) in spec {
                let stages = match stages {
                    Bson::Array(items) => items
                        .iter()
                        .map(|s| as_document("$facet", s).cloned())
                        .collect::<Result<Vec<_>>>()?,
                    _ => {
                        return Err(Error::Query(format!(
                            "$facet '{}' must be an array of stages",
                            facet
                        )))
                    }
                };
                let rows = run_pipeline(docs.clone(), &stages)?;
                out.insert(
                    facet.clone(),
                    Bson::Array(rows.into_iter().map(Bson::Document).collect()),
                );
            }
            Ok(vec![out])
        }
        "$count" => {
            let field = match spec {
                Bson::String(s) if !s.is_empty() && !s.starts_with('$') => s.clone(),
                _ => return Err(Error::Query("$count requires a field name".to_string())),
            };
            if docs.is_empty() {
                return Ok(Vec::new());
            }
            let mut out = Document::new();
            out.insert(field, count_to_bson(docs.len() as i64));
            Ok(vec![out])
        }
        other => Err(Error::Query(format!("unsupported pipeline stage '{}'", other))),
    }
}

// ─── Filters ────────────────────────────────────────────────────────

/// Whether `doc` satisfies `filter`. An empty filter matches everything.
pub fn matches(doc: &Document, filter: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for sub in as_filter_list(key, condition)? {
                    if !matches(doc, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for sub in as_filter_list(key, condition)? {
                    if matches(doc, sub)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$expr" => truthy(&evaluate(condition, doc)?),
            op if op.starts_with('$') => {
                return Err(Error::Query(format!("unsupported filter operator '{}'", op)))
            }
            field => match_field(lookup(doc, field), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn match_field(value: Option<&Bson>, condition: &Bson) -> Result<bool> {
    let operators = match condition {
        Bson::Document(ops) if ops.keys().next().is_some_and(|k| k.starts_with('$')) => ops,
        _ => return Ok(values_equal(value, condition)),
    };

    for (op, operand) in operators {
        let ok = match op.as_str() {
            "$eq" => values_equal(value, operand),
            "$ne" => !values_equal(value, operand),
            "$gt" => compare_present(value, operand) == Some(Ordering::Greater),
            "$gte" => matches!(
                compare_present(value, operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            "$lt" => compare_present(value, operand) == Some(Ordering::Less),
            "$lte" => matches!(
                compare_present(value, operand),
                Some(Ordering::Less | Ordering::Equal)
            ),
            "$in" => match operand {
                Bson::Array(items) => items.iter().any(|item| values_equal(value, item)),
                _ => return Err(Error::Query("$in requires an array".to_string())),
            },
            "$nin" => match operand {
                Bson::Array(items) => !items.iter().any(|item| values_equal(value, item)),
                _ => return Err(Error::Query("$nin requires an array".to_string())),
            },
            "$exists" => value.is_some() == truthy(operand),
            "$type" => match value {
                Some(v) => type_matches(v, operand)?,
                None => false,
            },
            other => {
                return Err(Error::Query(format!(
                    "unsupported comparison operator '{}'",
                    other
                )))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn values_equal(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        None => matches!(expected, Bson::Null),
        Some(v) => compare_present(Some(v), expected) == Some(Ordering::Equal),
    }
}

/// Comparison restricted to values of the same type class, as range
/// operators only compare like with like.
fn compare_present(value: Option<&Bson>, operand: &Bson) -> Option<Ordering> {
    let value = value?;
    if type_rank(value) != type_rank(operand) {
        return None;
    }
    Some(compare(value, operand))
}

fn type_matches(value: &Bson, alias: &Bson) -> Result<bool> {
    let alias = match alias {
        Bson::String(s) => s.as_str(),
        Bson::Array(items) => {
            for item in items {
                if type_matches(value, item)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        _ => return Err(Error::Query("$type expects a type alias".to_string())),
    };
    Ok(match alias {
        "double" => matches!(value, Bson::Double(_)),
        "string" => matches!(value, Bson::String(_)),
        "object" => matches!(value, Bson::Document(_)),
        "array" => matches!(value, Bson::Array(_)),
        "bool" => matches!(value, Bson::Boolean(_)),
        "date" => matches!(value, Bson::DateTime(_)),
        "null" => matches!(value, Bson::Null),
        "int" => matches!(value, Bson::Int32(_)),
        "long" => matches!(value, Bson::Int64(_)),
        "number" => matches!(value, Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_)),
        other => return Err(Error::Query(format!("unsupported $type alias '{}'", other))),
    })
}

// ─── Projection ─────────────────────────────────────────────────────

/// Apply a `$project` document to one trip document. Dotted output paths
/// nest, as `{"a.b": 1}` yields `{a: {b: ...}}`.
pub fn project(doc: &Document, spec: &Document) -> Result<Document> {
    let exclusion = spec
        .iter()
        .filter(|(field, _)| field.as_str() != "_id")
        .all(|(_, v)| is_flag(v) && !truthy(v));

    if exclusion {
        let mut out = doc.clone();
        for (field, v) in spec {
            if !truthy(v) {
                remove_path(&mut out, field);
            }
        }
        return Ok(out);
    }

    let mut out = Document::new();
    let keep_id = spec.get("_id").map_or(true, |v| !is_flag(v) || truthy(v));
    if keep_id {
        match spec.get("_id") {
            Some(expr) if !is_flag(expr) => {
                out.insert("_id", evaluate(expr, doc)?);
            }
            _ => {
                if let Some(id) = doc.get("_id") {
                    out.insert("_id", id.clone());
                }
            }
        }
    }

    for (field, v) in spec {
        if field == "_id" {
            continue;
        }
        if is_flag(v) {
            if !truthy(v) {
                return Err(Error::Query(format!(
                    "cannot exclude '{}' in an inclusion projection",
                    field
                )));
            }
            if let Some(value) = lookup(doc, field) {
                set_path(&mut out, field, value.clone())?;
            }
            continue;
        }
        if let Bson::String(path) = v {
            if let Some(path) = path.strip_prefix('$') {
                if let Some(value) = lookup(doc, path) {
                    set_path(&mut out, field, value.clone())?;
                }
                continue;
            }
        }
        set_path(&mut out, field, evaluate(v, doc)?)?;
    }
    Ok(out)
}

/// Set `value` at a dotted `path`, creating intermediate documents.
fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<()> {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            let parent = doc
                .entry(head.to_string())
                .or_insert_with(|| Bson::Document(Document::new()));
            match parent {
                Bson::Document(inner) => set_path(inner, rest, value),
                _ => Err(Error::Query(format!("projection path collision at '{}'", head))),
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(inner)) = doc.get_mut(head) {
                remove_path(inner, rest);
            }
        }
    }
}

fn is_flag(value: &Bson) -> bool {
    matches!(
        value,
        Bson::Boolean(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)
    )
}

// ─── Grouping ───────────────────────────────────────────────────────

enum Accumulator {
    Sum { int: i64, float: f64, is_float: bool },
    Avg { total: f64, n: u64 },
    First(Option<Bson>),
    Min(Option<Bson>),
    Max(Option<Bson>),
    Push(Vec<Bson>),
}

impl Accumulator {
    fn new(op: &str) -> Result<Self> {
        Ok(match op {
            "$sum" | "$count" => Accumulator::Sum {
                int: 0,
                float: 0.0,
                is_float: false,
            },
            "$avg" => Accumulator::Avg { total: 0.0, n: 0 },
            "$first" => Accumulator::First(None),
            "$min" => Accumulator::Min(None),
            "$max" => Accumulator::Max(None),
            "$push" => Accumulator::Push(Vec::new()),
            other => return Err(Error::Query(format!("unsupported accumulator '{}'", other))),
        })
    }

    fn update(&mut self, value: Bson) {
        match self {
            Accumulator::Sum {
                int,
                float,
                is_float,
            } => match value {
                Bson::Int32(v) => *int += v as i64,
                Bson::Int64(v) => *int += v,
                Bson::Double(v) => {
                    *float += v;
                    *is_float = true;
                }
                _ => {}
            },
            Accumulator::Avg { total, n } => {
                if let Some(v) = as_f64(&value) {
                    *total += v;
                    *n += 1;
                }
            }
            Accumulator::First(first) => {
                if first.is_none() {
                    *first = Some(value);
                }
            }
            Accumulator::Min(current) => {
                if !matches!(value, Bson::Null)
                    && current
                        .as_ref()
                        .map_or(true, |c| compare(&value, c) == Ordering::Less)
                {
                    *current = Some(value);
                }
            }
            Accumulator::Max(current) => {
                if !matches!(value, Bson::Null)
                    && current
                        .as_ref()
                        .map_or(true, |c| compare(&value, c) == Ordering::Greater)
                {
                    *current = Some(value);
                }
            }
            Accumulator::Push(values) => values.push(value),
        }
    }

    fn finish(self) -> Bson {
        match self {
            Accumulator::Sum {
                int,
                float,
                is_float,
            } => {
                if is_float {
                    Bson::Double(float + int as f64)
                } else {
                    count_to_bson(int)
                }
            }
            Accumulator::Avg { total, n } => {
                if n == 0 {
                    Bson::Null
                } else {
                    Bson::Double(total / n as f64)
                }
            }
            Accumulator::First(v) | Accumulator::Min(v) | Accumulator::Max(v) => {
                v.unwrap_or(Bson::Null)
            }
            Accumulator::Push(values) => Bson::Array(values),
        }
    }
}

fn group(docs: Vec<Document>, spec: &Document) -> Result<Vec<Document>> {
    let key_expr = spec
        .get("_id")
        .ok_or_else(|| Error::Query("$group requires an _id".to_string()))?;

    let mut fields: Vec<(String, String, Bson)> = Vec::new();
    for (name, acc) in spec {
        if name == "_id" {
            continue;
        }
        let acc = as_document("$group", acc)?;
        let mut entries = acc.iter();
        match (entries.next(), entries.next()) {
            (Some((op, expr)), None) => {
                let expr = if op == "$count" {
                    Bson::Int32(1)
                } else {
                    expr.clone()
                };
                Accumulator::new(op)?;
                fields.push((name.clone(), op.clone(), expr));
            }
            _ => {
                return Err(Error::Query(format!(
                    "accumulator '{}' must have exactly one operator",
                    name
                )))
            }
        }
    }

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(Bson, Vec<Accumulator>)> = Vec::new();

    for doc in &docs {
        let key = evaluate(key_expr, doc)?;
        let slot = match index.get(&group_key(&key)) {
            Some(slot) => *slot,
            None => {
                let accumulators = fields
                    .iter()
                    .map(|(_, op, _)| Accumulator::new(op))
                    .collect::<Result<Vec<_>>>()?;
                index.insert(group_key(&key), groups.len());
                groups.push((key, accumulators));
                groups.len() - 1
            }
        };
        for (acc, (_, _, expr)) in groups[slot].1.iter_mut().zip(&fields) {
            acc.update(evaluate(expr, doc)?);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, accumulators)| {
            let mut out = Document::new();
            out.insert("_id", key);
            for (acc, (name, _, _)) in accumulators.into_iter().zip(&fields) {
                out.insert(name.clone(), acc.finish());
            }
            out
        })
        .collect())
}

/// Hashable identity for a group key; numerically equal keys share a group.
fn group_key(key: &Bson) -> String {
    fn normalize(value: &Bson) -> Bson {
        match value {
            Bson::Int32(v) => Bson::Double(*v as f64),
            Bson::Int64(v) => Bson::Double(*v as f64),
            Bson::Document(d) => Bson::Document(
                d.iter()
                    .map(|(k, v)| (k.clone(), normalize(v)))
                    .collect(),
            ),
            Bson::Array(items) => Bson::Array(items.iter().map(normalize).collect()),
            other => other.clone(),
        }
    }
    format!("{:?}", normalize(key))
}

// ─── Sorting ────────────────────────────────────────────────────────

fn sort(mut docs: Vec<Document>, spec: &Document) -> Result<Vec<Document>> {
    let mut keys = Vec::with_capacity(spec.len());
    for (field, direction) in spec {
        let descending = match as_f64(direction) {
            Some(d) if d == 1.0 => false,
            Some(d) if d == -1.0 => true,
            _ => {
                return Err(Error::Query(format!(
                    "sort direction for '{}' must be 1 or -1",
                    field
                )))
            }
        };
        keys.push((field.as_str(), descending));
    }

    docs.sort_by(|a, b| {
        for (field, descending) in &keys {
            let left = lookup(a, field).unwrap_or(&Bson::Null);
            let right = lookup(b, field).unwrap_or(&Bson::Null);
            let ordering = compare(left, right);
            let ordering = if *descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    Ok(docs)
}

// ─── Distinct ───────────────────────────────────────────────────────

/// Distinct values of `field` among `docs`, in first-seen order.
pub fn distinct<'a>(docs: impl IntoIterator<Item = &'a Document>, field: &str) -> Vec<Bson> {
    let mut values = DistinctValues::new(field);
    for doc in docs {
        values.add(doc);
    }
    values.into_values()
}

/// Running set of distinct values of one field. Array values contribute
/// each element.
pub struct DistinctValues<'f> {
    field: &'f str,
    seen: HashSet<String>,
    values: Vec<Bson>,
}

impl<'f> DistinctValues<'f> {
    pub fn new(field: &'f str) -> Self {
        Self {
            field,
            seen: HashSet::new(),
            values: Vec::new(),
        }
    }

    pub fn add(&mut self, doc: &Document) {
        let found: Vec<&Bson> = match lookup(doc, self.field) {
            Some(Bson::Array(items)) => items.iter().collect(),
            Some(value) => vec![value],
            None => Vec::new(),
        };
        for value in found {
            if self.seen.insert(group_key(value)) {
                self.values.push(value.clone());
            }
        }
    }

    pub fn into_values(self) -> Vec<Bson> {
        self.values
    }
}

// ─── Expressions ────────────────────────────────────────────────────

/// Evaluate an aggregation expression against one document.
pub fn evaluate(expr: &Bson, doc: &Document) -> Result<Bson> {
    match expr {
        Bson::String(s) if s == "$$ROOT" => Ok(Bson::Document(doc.clone())),
        Bson::String(s) if s.starts_with("$$") => {
            Err(Error::Query(format!("unsupported variable '{}'", s)))
        }
        Bson::String(s) if s.starts_with('$') => {
            Ok(lookup(doc, &s[1..]).cloned().unwrap_or(Bson::Null))
        }
        Bson::Document(d) => {
            let mut entries = d.iter();
            if let (Some((op, arg)), None) = (entries.next(), entries.next()) {
                if op.starts_with('$') {
                    return evaluate_operator(op, arg, doc);
                }
            }
            let mut out = Document::new();
            for (field, sub) in d {
                out.insert(field.clone(), evaluate(sub, doc)?);
            }
            Ok(Bson::Document(out))
        }
        Bson::Array(items) => Ok(Bson::Array(
            items
                .iter()
                .map(|item| evaluate(item, doc))
                .collect::<Result<Vec<_>>>()?,
        )),
        other => Ok(other.clone()),
    }
}

fn evaluate_operator(op: &str, arg: &Bson, doc: &Document) -> Result<Bson> {
    match op {
        "$literal" => Ok(arg.clone()),
        "$toDate" => to_date(&evaluate(single_arg(op, arg)?, doc)?),
        "$subtract" => {
            let [left, right] = two_args(op, arg, doc)?;
            subtract(&left, &right)
        }
        "$eq" => {
            let [left, right] = two_args(op, arg, doc)?;
            Ok(Bson::Boolean(values_equal(Some(&left), &right)))
        }
        "$ne" => {
            let [left, right] = two_args(op, arg, doc)?;
            Ok(Bson::Boolean(!values_equal(Some(&left), &right)))
        }
        "$year" | "$month" | "$dayOfMonth" | "$hour" | "$minute" | "$dayOfWeek" => {
            let inner = match arg {
                Bson::Document(d) if d.contains_key("date") => d.get("date").unwrap_or(&Bson::Null),
                other => single_arg(op, other)?,
            };
            match evaluate(inner, doc)? {
                Bson::Null => Ok(Bson::Null),
                Bson::DateTime(dt) => {
                    let dt = to_chrono(&dt)?;
                    Ok(Bson::Int32(match op {
                        "$year" => dt.year(),
                        "$month" => dt.month() as i32,
                        "$dayOfMonth" => dt.day() as i32,
                        "$hour" => dt.hour() as i32,
                        "$minute" => dt.minute() as i32,
                        _ => dt.weekday().number_from_sunday() as i32,
                    }))
                }
                other => Err(Error::Query(format!(
                    "{} requires a date, found {}",
                    op, other
                ))),
            }
        }
        other => Err(Error::Query(format!(
            "unsupported expression operator '{}'",
            other
        ))),
    }
}

fn single_arg<'a>(op: &str, arg: &'a Bson) -> Result<&'a Bson> {
    match arg {
        Bson::Array(items) if items.len() == 1 => Ok(&items[0]),
        Bson::Array(_) => Err(Error::Query(format!("{} takes exactly one argument", op))),
        other => Ok(other),
    }
}

fn two_args(op: &str, arg: &Bson, doc: &Document) -> Result<[Bson; 2]> {
    match arg {
        Bson::Array(items) if items.len() == 2 => {
            Ok([evaluate(&items[0], doc)?, evaluate(&items[1], doc)?])
        }
        _ => Err(Error::Query(format!("{} takes exactly two arguments", op))),
    }
}

fn subtract(left: &Bson, right: &Bson) -> Result<Bson> {
    Ok(match (left, right) {
        (Bson::Null, _) | (_, Bson::Null) => Bson::Null,
        (Bson::DateTime(a), Bson::DateTime(b)) => {
            Bson::Int64(a.timestamp_millis() - b.timestamp_millis())
        }
        (Bson::DateTime(a), b) => match as_f64(b) {
            Some(ms) => Bson::DateTime(BsonDateTime::from_millis(
                a.timestamp_millis() - ms as i64,
            )),
            None => return Err(Error::Query(format!("cannot subtract {} from a date", b))),
        },
        (Bson::Double(_), _) | (_, Bson::Double(_)) => match (as_f64(left), as_f64(right)) {
            (Some(a), Some(b)) => Bson::Double(a - b),
            _ => return Err(Error::Query("$subtract requires numbers or dates".to_string())),
        },
        (a, b) => match (as_i64(a), as_i64(b)) {
            (Some(a), Some(b)) => Bson::Int64(a - b),
            _ => return Err(Error::Query("$subtract requires numbers or dates".to_string())),
        },
    })
}

fn to_date(value: &Bson) -> Result<Bson> {
    match value {
        Bson::Null | Bson::DateTime(_) => Ok(value.clone()),
        Bson::Int64(ms) => Ok(Bson::DateTime(BsonDateTime::from_millis(*ms))),
        Bson::Int32(ms) => Ok(Bson::DateTime(BsonDateTime::from_millis(*ms as i64))),
        Bson::Double(ms) => Ok(Bson::DateTime(BsonDateTime::from_millis(*ms as i64))),
        Bson::String(s) => parse_date_string(s)
            .map(|dt| Bson::DateTime(BsonDateTime::from_millis(dt.timestamp_millis())))
            .ok_or_else(|| Error::Query(format!("$toDate cannot parse '{}'", s))),
        other => Err(Error::Query(format!("$toDate cannot convert {}", other))),
    }
}

fn parse_date_string(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn to_chrono(dt: &BsonDateTime) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis())
        .ok_or_else(|| Error::Query(format!("date out of range: {}", dt)))
}

// ─── Value helpers ──────────────────────────────────────────────────

/// Resolve a dotted field path.
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Cross-type ordering: null < numbers < strings < objects < arrays <
/// object ids < booleans < dates.
fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 13,
        _ => 12,
    }
}

/// Total ordering used by `$sort`, `$min` and `$max`.
pub fn compare(a: &Bson, b: &Bson) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.timestamp_millis().cmp(&y.timestamp_millis()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Document(x), Bson::Document(y)) => {
            for ((kx, vx), (ky, vy)) in x.iter().zip(y.iter()) {
                let ordering = kx.cmp(ky).then_with(|| compare(vx, vy));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Array(x), Bson::Array(y)) => {
            for (vx, vy) in x.iter().zip(y.iter()) {
                let ordering = compare(vx, vy);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => match (as_i64_exact(a), as_i64_exact(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => match (as_f64(a), as_f64(b)) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            },
        },
    }
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Null | Bson::Undefined => false,
        Bson::Boolean(b) => *b,
        Bson::Int32(v) => *v != 0,
        Bson::Int64(v) => *v != 0,
        Bson::Double(v) => *v != 0.0,
        _ => true,
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(*v as i64),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) if v.fract() == 0.0 => Some(*v as i64),
        _ => None,
    }
}

fn as_i64_exact(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(*v as i64),
        Bson::Int64(v) => Some(*v),
        _ => None,
    }
}

fn count_to_bson(n: i64) -> Bson {
    match i32::try_from(n) {
        Ok(small) => Bson::Int32(small),
        Err(_) => Bson::Int64(n),
    }
}

fn as_document<'a>(context: &str, value: &'a Bson) -> Result<&'a Document> {
    match value {
        Bson::Document(d) => Ok(d),
        other => Err(Error::Query(format!(
            "{} expects a document, found {}",
            context, other
        ))),
    }
}

fn as_filter_list<'a>(context: &str, value: &'a Bson) -> Result<Vec<&'a Document>> {
    match value {
        Bson::Array(items) => items.iter().map(|item| as_document(context, item)).collect(),
        _ => Err(Error::Query(format!("{} expects an array", context))),
    }
}

fn as_count(context: &str, value: &Bson) -> Result<usize> {
    match as_i64(value) {
        Some(n) if n >= 0 => Ok(n as usize),
        _ => Err(Error::Query(format!(
            "{} expects a non-negative integer, found {}",
            context, value
        ))),
    }
}
