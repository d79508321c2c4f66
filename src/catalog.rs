//! Model catalog: the static, append-only list of installable model definitions

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const GB: u64 = 1024 * 1024 * 1024;
const MB: u64 = 1024 * 1024;

/// Kind of model artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Base,
    Lora,
    Vae,
    Adapter,
    TextEncoder,
    Caption,
    Upscaler,
    Other,
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Base => write!(f, "base"),
            Self::Lora => write!(f, "lora"),
            Self::Vae => write!(f, "vae"),
            Self::Adapter => write!(f, "adapter"),
            Self::TextEncoder => write!(f, "text_encoder"),
            Self::Caption => write!(f, "caption"),
            Self::Upscaler => write!(f, "upscaler"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Acquisition method for a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Hub,
    Marketplace,
    DirectUrl,
    Local,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hub => write!(f, "hub"),
            Self::Marketplace => write!(f, "marketplace"),
            Self::DirectUrl => write!(f, "direct_url"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Where a model's artifacts come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceLocator {
    /// Hub repository; an empty file list means the whole repository
    Hub {
        repo_id: String,
        #[serde(default)]
        files: Vec<String>,
    },
    /// Community marketplace model, by explicit ids or by page/download URL
    Marketplace {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version_id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    DirectUrl {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    Local,
}

impl SourceLocator {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Hub { .. } => SourceKind::Hub,
            Self::Marketplace { .. } => SourceKind::Marketplace,
            Self::DirectUrl { .. } => SourceKind::DirectUrl,
            Self::Local => SourceKind::Local,
        }
    }

    /// Canonical key used to deduplicate installed models across sources
    ///
    /// Hub locators key on the repository only, so a durable record and a
    /// cache-discovered copy of the same repository collapse to one key.
    pub fn key(&self) -> String {
        match self {
            Self::Hub { repo_id, .. } => hub_locator_key(repo_id),
            Self::Marketplace {
                model_id,
                version_id,
                url,
            } => match (model_id, version_id) {
                (None, None) => format!("marketplace:{}", url.as_deref().unwrap_or_default()),
                (m, v) => format!(
                    "marketplace:{}:{}",
                    m.map(|m| m.to_string()).unwrap_or_default(),
                    v.map(|v| v.to_string()).unwrap_or_default()
                ),
            },
            Self::DirectUrl { url, .. } => format!("url:{}", url),
            Self::Local => "local".to_string(),
        }
    }
}

/// Locator key for a hub repository
///
/// Hub repository ids are case-insensitive, so the key is lowercased.
pub fn hub_locator_key(repo_id: &str) -> String {
    format!("hub:{}", repo_id.to_ascii_lowercase())
}

/// Immutable definition of an installable model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub id: String,
    pub name: String,
    /// Taxonomy tag, e.g. "flux", "sdxl", "qwen-vl"
    pub family: String,
    pub model_type: ModelType,
    pub source: SourceLocator,
    /// Catalog-stated size in bytes; an estimate, not a content-length guarantee
    pub expected_size: u64,
    #[serde(default)]
    pub requires_credential: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Filter for catalog and installed-model listings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelFilter {
    pub family: Option<String>,
    #[serde(rename = "type")]
    pub model_type: Option<ModelType>,
    pub source: Option<SourceKind>,
}

impl ModelFilter {
    pub fn matches(&self, family: &str, model_type: ModelType, source: Option<SourceKind>) -> bool {
        if let Some(f) = &self.family
            && !f.eq_ignore_ascii_case(family)
        {
            return false;
        }
        if let Some(t) = self.model_type
            && t != model_type
        {
            return false;
        }
        if let Some(s) = self.source
            && Some(s) != source
        {
            return false;
        }
        true
    }
}

/// Append-only catalog of model definitions
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    definitions: Vec<ModelDefinition>,
    index: HashMap<String, usize>,
}

impl Catalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog seeded with the builtin definitions
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for definition in builtin_definitions() {
            // Builtin ids are unique
            let _ = catalog.append(definition);
        }
        catalog
    }

    /// Load the builtin catalog plus an optional JSON extension file
    pub fn load(extra: Option<&Path>) -> Result<Self> {
        let mut catalog = Self::builtin();

        if let Some(path) = extra {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read catalog file: {:?}", path))?;
            let definitions: Vec<ModelDefinition> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse catalog file: {:?}", path))?;

            let count = definitions.len();
            for definition in definitions {
                catalog.append(definition)?;
            }
            tracing::info!(path = ?path, added = count, "Catalog extension loaded");
        }

        Ok(catalog)
    }

    /// Append a definition; ids are never replaced
    pub fn append(&mut self, definition: ModelDefinition) -> Result<()> {
        if definition.id.trim().is_empty() {
            anyhow::bail!("Catalog definition id cannot be empty");
        }
        if self.index.contains_key(&definition.id) {
            anyhow::bail!("Duplicate catalog definition id: {}", definition.id);
        }
        self.index
            .insert(definition.id.clone(), self.definitions.len());
        self.definitions.push(definition);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ModelDefinition> {
        self.index.get(id).map(|&i| &self.definitions[i])
    }

    pub fn list(&self, filter: &ModelFilter) -> Vec<ModelDefinition> {
        self.definitions
            .iter()
            .filter(|d| filter.matches(&d.family, d.model_type, Some(d.source.kind())))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Catalog definition backed by a hub repository
    pub fn definition_for_repo(&self, repo_id: &str) -> Option<&ModelDefinition> {
        self.definitions.iter().find(|d| {
            matches!(&d.source, SourceLocator::Hub { repo_id: r, .. } if r.eq_ignore_ascii_case(repo_id))
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn hub(
    id: &str,
    name: &str,
    family: &str,
    model_type: ModelType,
    repo: &str,
    files: &[&str],
    size: u64,
    gated: bool,
) -> ModelDefinition {
    ModelDefinition {
        id: id.to_string(),
        name: name.to_string(),
        family: family.to_string(),
        model_type,
        source: SourceLocator::Hub {
            repo_id: repo.to_string(),
            files: files.iter().map(|f| f.to_string()).collect(),
        },
        expected_size: size,
        requires_credential: gated,
        description: None,
    }
}

fn builtin_definitions() -> Vec<ModelDefinition> {
    vec![
        hub(
            "flux1-dev",
            "FLUX.1 [dev]",
            "flux",
            ModelType::Base,
            "black-forest-labs/FLUX.1-dev",
            &["flux1-dev.safetensors", "ae.safetensors"],
            23_800 * MB,
            true,
        ),
        hub(
            "flux1-schnell",
            "FLUX.1 [schnell]",
            "flux",
            ModelType::Base,
            "black-forest-labs/FLUX.1-schnell",
            &["flux1-schnell.safetensors"],
            23_800 * MB,
            false,
        ),
        hub(
            "flux-t5xxl-fp16",
            "T5-XXL text encoder (fp16)",
            "flux",
            ModelType::TextEncoder,
            "comfyanonymous/flux_text_encoders",
            &["t5xxl_fp16.safetensors"],
            9_790 * MB,
            false,
        ),
        hub(
            "sdxl-base",
            "Stable Diffusion XL Base 1.0",
            "sdxl",
            ModelType::Base,
            "stabilityai/stable-diffusion-xl-base-1.0",
            &["sd_xl_base_1.0.safetensors"],
            6_940 * MB,
            false,
        ),
        hub(
            "sdxl-vae-fp16-fix",
            "SDXL VAE (fp16 fix)",
            "sdxl",
            ModelType::Vae,
            "madebyollin/sdxl-vae-fp16-fix",
            &["sdxl_vae.safetensors"],
            335 * MB,
            false,
        ),
        hub(
            "qwen2.5-vl-7b-caption",
            "Qwen2.5-VL 7B Instruct (Q8_0 GGUF)",
            "qwen-vl",
            ModelType::Caption,
            "unsloth/Qwen2.5-VL-7B-Instruct-GGUF",
            &["Qwen2.5-VL-7B-Instruct-Q8_0.gguf", "mmproj-F16.gguf"],
            9_400 * MB,
            false,
        ),
        hub(
            "wan2.1-t2v-1.3b",
            "Wan 2.1 T2V 1.3B",
            "wan",
            ModelType::Base,
            "Wan-AI/Wan2.1-T2V-1.3B",
            &[],
            17 * GB,
            false,
        ),
        ModelDefinition {
            id: "realistic-vision-v6".to_string(),
            name: "Realistic Vision V6.0 B1".to_string(),
            family: "sd15".to_string(),
            model_type: ModelType::Base,
            source: SourceLocator::Marketplace {
                model_id: Some(4201),
                version_id: Some(245598),
                url: None,
            },
            expected_size: 2_130 * MB,
            requires_credential: false,
            description: None,
        },
        ModelDefinition {
            id: "4x-ultrasharp".to_string(),
            name: "4x UltraSharp".to_string(),
            family: "upscale".to_string(),
            model_type: ModelType::Upscaler,
            source: SourceLocator::DirectUrl {
                url: "https://huggingface.co/lokCX/4x-Ultrasharp/resolve/main/4x-UltraSharp.pth"
                    .to_string(),
                filename: None,
            },
            expected_size: 67 * MB,
            requires_credential: false,
            description: None,
        },
    ]
}
