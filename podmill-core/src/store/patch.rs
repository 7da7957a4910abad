//! Typed patch → parameterized UPDATE construction, and the post-write
//! field comparison that keeps validation honest.

use chrono::{DateTime, Utc};
use podmill_model::{
    merge_additional_data, AdditionalData, EnrichmentUpdate, Episode, EpisodePatch,
};
use serde_json::Value;

/// One bind value for a generated statement, in positional order.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Json(Value),
    TextArray(Vec<String>),
}

/// A generated UPDATE: SQL text plus its bind values. The row id is always
/// the final parameter.
#[derive(Debug, Clone)]
pub struct UpdateStatement {
    pub sql: String,
    pub values: Vec<BindValue>,
}

struct UpdateBuilder {
    clauses: Vec<String>,
    values: Vec<BindValue>,
}

impl UpdateBuilder {
    fn new() -> Self {
        Self {
            clauses: Vec::new(),
            values: Vec::new(),
        }
    }

    fn set(&mut self, column: &str, value: BindValue) {
        self.values.push(value);
        self.clauses.push(format!("{column} = ${}", self.values.len()));
    }

    fn finish(mut self) -> UpdateStatement {
        self.clauses.push("updated_at = NOW()".to_string());
        let id_param = self.values.len() + 1;
        let sql = format!(
            "UPDATE episodes SET {} WHERE id = ${id_param} AND deleted_at IS NULL",
            self.clauses.join(", ")
        );
        UpdateStatement {
            sql,
            values: self.values,
        }
    }
}

/// Build the single UPDATE for `patch`.
///
/// `current_additional` is the row's milestone ledger as read under the row
/// lock; the patch's map is merged into it here so the statement writes the
/// post-merge value, never a blind replacement.
pub fn build_update(patch: &EpisodePatch, current_additional: &AdditionalData) -> UpdateStatement {
    let mut builder = UpdateBuilder::new();

    if let Some(v) = &patch.title {
        builder.set("title", BindValue::Text(v.clone()));
    }
    if let Some(v) = &patch.description {
        builder.set("description", BindValue::Text(v.clone()));
    }
    if let Some(v) = &patch.host_name {
        builder.set("host_name", BindValue::Text(v.clone()));
    }
    if let Some(v) = &patch.host_description {
        builder.set("host_description", BindValue::Text(v.clone()));
    }
    if let Some(v) = &patch.country {
        builder.set("country", BindValue::Text(v.clone()));
    }
    if let Some(v) = &patch.genre {
        builder.set("genre", BindValue::Text(v.clone()));
    }
    if let Some(v) = &patch.published_at {
        builder.set("published_at", BindValue::Timestamp(*v));
    }
    if let Some(v) = &patch.original_media_uri {
        builder.set("original_media_uri", BindValue::Text(v.clone()));
    }
    if let Some(v) = &patch.manifest_uri {
        builder.set("manifest_uri", BindValue::Text(v.clone()));
    }
    if let Some(v) = &patch.thumbnail_uri {
        builder.set("thumbnail_uri", BindValue::Text(v.clone()));
    }
    if let Some(v) = patch.processing_done {
        builder.set("processing_done", BindValue::Bool(v));
    }
    if let Some(v) = patch.is_synced {
        builder.set("is_synced", BindValue::Bool(v));
    }
    if let Some(incoming) = &patch.additional_data {
        if !incoming.is_empty() {
            let merged = merge_additional_data(current_additional, incoming);
            builder.set("additional_data", BindValue::Json(Value::Object(merged)));
        }
    }

    builder.finish()
}

/// Build the specialized UPDATE for an enrichment result.
pub fn build_enrichment_update(
    enrichment: &EnrichmentUpdate,
    current_additional: &AdditionalData,
) -> UpdateStatement {
    let mut builder = UpdateBuilder::new();
    builder.set("guests", BindValue::TextArray(enrichment.guests.clone()));
    builder.set(
        "guest_descriptions",
        BindValue::TextArray(enrichment.guest_descriptions.clone()),
    );
    builder.set(
        "guest_image_urls",
        BindValue::TextArray(enrichment.guest_image_urls.clone()),
    );
    builder.set("topics", BindValue::TextArray(enrichment.topics.clone()));
    if !enrichment.extra_metadata.is_empty() {
        let merged = merge_additional_data(current_additional, &enrichment.extra_metadata);
        builder.set("additional_data", BindValue::Json(Value::Object(merged)));
    }
    builder.finish()
}

/// Compare a freshly read row against the intent of `patch`, returning the
/// names of fields that did not take effect. The ledger comparison checks the
/// intended keys only: a concurrent writer may legitimately have added
/// others since commit.
pub fn mismatches(episode: &Episode, patch: &EpisodePatch) -> Vec<&'static str> {
    let mut out = Vec::new();

    fn check<'a, T: PartialEq>(
        out: &mut Vec<&'a str>,
        name: &'a str,
        intended: &Option<T>,
        actual: &T,
    ) {
        if let Some(intended) = intended {
            if intended != actual {
                out.push(name);
            }
        }
    }

    fn check_opt<'a, T: PartialEq>(
        out: &mut Vec<&'a str>,
        name: &'a str,
        intended: &Option<T>,
        actual: &Option<T>,
    ) {
        if let Some(intended) = intended {
            if actual.as_ref() != Some(intended) {
                out.push(name);
            }
        }
    }

    check(&mut out, "title", &patch.title, &episode.title);
    check_opt(&mut out, "description", &patch.description, &episode.description);
    check_opt(&mut out, "host_name", &patch.host_name, &episode.host_name);
    check_opt(
        &mut out,
        "host_description",
        &patch.host_description,
        &episode.host_description,
    );
    check_opt(&mut out, "country", &patch.country, &episode.country);
    check_opt(&mut out, "genre", &patch.genre, &episode.genre);
    check_opt(
        &mut out,
        "published_at",
        &patch.published_at,
        &episode.published_at,
    );
    check_opt(
        &mut out,
        "original_media_uri",
        &patch.original_media_uri,
        &episode.original_media_uri,
    );
    check_opt(
        &mut out,
        "manifest_uri",
        &patch.manifest_uri,
        &episode.manifest_uri,
    );
    check_opt(
        &mut out,
        "thumbnail_uri",
        &patch.thumbnail_uri,
        &episode.thumbnail_uri,
    );
    check(
        &mut out,
        "processing_done",
        &patch.processing_done,
        &episode.processing_done,
    );
    check(&mut out, "is_synced", &patch.is_synced, &episode.is_synced);

    if let Some(intended) = &patch.additional_data {
        for (key, value) in intended {
            if episode.additional_data.get(key) != Some(value) {
                out.push("additional_data");
                break;
            }
        }
    }

    out
}

/// Field comparison for the enrichment write.
pub fn enrichment_mismatches(
    episode: &Episode,
    enrichment: &EnrichmentUpdate,
) -> Vec<&'static str> {
    let mut out = Vec::new();
    if episode.guests != enrichment.guests {
        out.push("guests");
    }
    if episode.guest_descriptions != enrichment.guest_descriptions {
        out.push("guest_descriptions");
    }
    if episode.guest_image_urls != enrichment.guest_image_urls {
        out.push("guest_image_urls");
    }
    if episode.topics != enrichment.topics {
        out.push("topics");
    }
    for (key, value) in &enrichment.extra_metadata {
        if episode.additional_data.get(key) != Some(value) {
            out.push("additional_data");
            break;
        }
    }
    out
}
