//! Cache key helpers.
//!
//! Every key is `{category}:{rest}` so a whole category (or one owner's
//! slice of it) can be dropped with a single prefix invalidation.

use sha2::{Digest, Sha256};

/// Key namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCategory {
    /// Parsed transcript text, shared by every owner of a video
    Transcript,
    /// Video metadata (title, duration, ...)
    Metadata,
    /// LLM output keyed by a hash of its inputs, shared across owners
    AiResult,
    /// A single owner's processed result for a video
    OwnerResult,
    /// Short-lived quota/credit snapshots
    Quota,
}

impl CacheCategory {
    pub const ALL: [CacheCategory; 5] = [
        CacheCategory::Transcript,
        CacheCategory::Metadata,
        CacheCategory::AiResult,
        CacheCategory::OwnerResult,
        CacheCategory::Quota,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCategory::Transcript => "transcript",
            CacheCategory::Metadata => "metadata",
            CacheCategory::AiResult => "ai-result",
            CacheCategory::OwnerResult => "owner-result",
            CacheCategory::Quota => "quota",
        }
    }

    /// `"{category}:"`, for prefix invalidation.
    pub fn prefix(&self) -> String {
        format!("{}:", self.as_str())
    }

    /// Category a key belongs to, if it carries a known prefix.
    pub fn of_key(key: &str) -> Option<Self> {
        let (prefix, _) = key.split_once(':')?;
        Self::ALL.into_iter().find(|c| c.as_str() == prefix)
    }
}

/// Hex SHA-256 over the given parts, separated so `["ab", "c"]` and
/// `["a", "bc"]` hash differently.
pub fn content_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Generate a stable cache id for a video.
///
/// - Plain ids are used as-is
/// - URLs are hashed so keys stay short and free of separators
pub fn video_cache_id(video_key: &str) -> String {
    let trimmed = video_key.trim();
    if trimmed.contains("://") || trimmed.contains(':') {
        format!("{:x}", Sha256::digest(trimmed.as_bytes()))
    } else {
        trimmed.to_string()
    }
}

/// Format: `transcript:{video}`
pub fn transcript_key(video_key: &str) -> String {
    format!("{}:{}", CacheCategory::Transcript.as_str(), video_cache_id(video_key))
}

/// Format: `metadata:{video}`
pub fn metadata_key(video_key: &str) -> String {
    format!("{}:{}", CacheCategory::Metadata.as_str(), video_cache_id(video_key))
}

/// Format: `ai-result:{sha256(transcript, prompt)}`
///
/// Identical inputs from different owners land on the same key.
pub fn ai_result_key(transcript: &str, prompt: Option<&str>) -> String {
    format!(
        "{}:{}",
        CacheCategory::AiResult.as_str(),
        content_hash(&[transcript, prompt.unwrap_or("")])
    )
}

/// Format: `owner-result:{owner}:{video}`
pub fn owner_result_key(owner: &str, video_key: &str) -> String {
    format!("{}{}", owner_result_prefix(owner), video_cache_id(video_key))
}

/// Format: `owner-result:{owner}:`
pub fn owner_result_prefix(owner: &str) -> String {
    format!("{}:{}:", CacheCategory::OwnerResult.as_str(), owner)
}

/// Format: `quota:{owner}`
pub fn quota_key(owner: &str) -> String {
    format!("{}:{}", CacheCategory::Quota.as_str(), owner)
}
