use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// String-keyed metadata attached to every indexed vector.
///
/// Ordered so that serialized payloads and test assertions are stable.
pub type Metadata = BTreeMap<String, String>;

/// Who may see an uploaded chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    #[default]
    #[serde(rename = "personal")]
    Personal,
    #[serde(rename = "org-wide")]
    OrgWide,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Personal => "personal",
            Visibility::OrgWide => "org-wide",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "personal" => Ok(Visibility::Personal),
            "org-wide" => Ok(Visibility::OrgWide),
            other => Err(format!("unknown visibility: {other}")),
        }
    }
}

/// Required and optional fields describing where a chunk came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub file_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    /// Anything else a caller wants carried through to search results.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: Metadata,
}

impl ChunkMetadata {
    pub fn new(
        source: impl Into<String>,
        chunk_index: usize,
        total_chunks: usize,
        file_type: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            chunk_index,
            total_chunks,
            file_type: file_type.into(),
            file_path: None,
            user_id: None,
            org_id: None,
            visibility: None,
            extra: Metadata::new(),
        }
    }

    /// Flattens into the string map stored next to the vector.
    pub fn to_map(&self) -> Metadata {
        let mut map = self.extra.clone();
        map.insert("source".to_string(), self.source.clone());
        map.insert("chunk_index".to_string(), self.chunk_index.to_string());
        map.insert("total_chunks".to_string(), self.total_chunks.to_string());
        map.insert("file_type".to_string(), self.file_type.clone());
        if let Some(path) = &self.file_path {
            map.insert("file_path".to_string(), path.clone());
        }
        if let Some(user_id) = &self.user_id {
            map.insert("user_id".to_string(), user_id.clone());
        }
        if let Some(org_id) = &self.org_id {
            map.insert("org_id".to_string(), org_id.clone());
        }
        if let Some(visibility) = self.visibility {
            map.insert("visibility".to_string(), visibility.to_string());
        }
        map
    }

    /// Rebuilds typed metadata from a stored map. Unknown keys land in `extra`.
    pub fn from_map(map: &Metadata) -> Self {
        let mut extra = map.clone();
        let mut take = |key: &str| extra.remove(key);

        let source = take("source").unwrap_or_default();
        let chunk_index = take("chunk_index").and_then(|v| v.parse().ok()).unwrap_or(0);
        let total_chunks = take("total_chunks").and_then(|v| v.parse().ok()).unwrap_or(0);
        let file_type = take("file_type").unwrap_or_default();
        let file_path = take("file_path");
        let user_id = take("user_id");
        let org_id = take("org_id");
        let visibility = take("visibility").and_then(|v| v.parse().ok());

        Self {
            source,
            chunk_index,
            total_chunks,
            file_type,
            file_path,
            user_id,
            org_id,
            visibility,
            extra,
        }
    }
}

/// A bounded segment of a source document, the unit of indexing and retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub content: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn new(content: impl Into<String>, metadata: ChunkMetadata) -> Self {
        Self {
            content: content.into(),
            metadata,
        }
    }

    /// Stable identity over source, position and the full content.
    ///
    /// Re-ingesting the same corpus reproduces the same ids, so stores upsert
    /// instead of duplicating.
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.metadata.source.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.metadata.chunk_index.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.content.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A chunk plus its embedding, as handed to a vector store.
///
/// Never mutated once stored; updating means upserting under the same id.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            embedding,
            metadata: Metadata::new(),
        }
    }

    pub fn from_chunk(chunk: Chunk, embedding: Vec<f32>) -> Self {
        Self {
            id: chunk.id(),
            metadata: chunk.metadata.to_map(),
            content: chunk.content,
            embedding,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A hit returned by a similarity search.
///
/// `distance` is backend-defined (lower is more similar); only the relative
/// ordering within one result list is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    pub distance: f32,
}

impl SearchResult {
    /// Source name recorded at ingestion, if any.
    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").map(|s| s.as_str())
    }
}

/// Predicate over chunk metadata used to narrow a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataFilter {
    Eq { key: String, value: String },
    In { key: String, values: Vec<String> },
    And(Vec<MetadataFilter>),
    Or(Vec<MetadataFilter>),
}

impl MetadataFilter {
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Eq {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn any_of(key: impl Into<String>, values: Vec<String>) -> Self {
        Self::In {
            key: key.into(),
            values,
        }
    }

    /// Chunks a user may see: their own personal uploads plus everything
    /// shared with their organization.
    pub fn visible_to(user_id: &str, org_id: &str) -> Self {
        Self::Or(vec![
            Self::And(vec![
                Self::eq("user_id", user_id),
                Self::eq("visibility", Visibility::Personal.as_str()),
            ]),
            Self::And(vec![
                Self::eq("org_id", org_id),
                Self::eq("visibility", Visibility::OrgWide.as_str()),
            ]),
        ])
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            Self::Eq { key, value } => metadata.get(key) == Some(value),
            Self::In { key, values } => metadata
                .get(key)
                .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
            Self::And(filters) => filters.iter().all(|f| f.matches(metadata)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(metadata)),
        }
    }
}
