use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn from_env() -> Self {
        match std::env::var("ENVIRONMENT").as_deref() {
            Ok("production") => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn collection_name(&self) -> &'static str {
        match self {
            Self::Development => "chunks_development",
            Self::Production => "chunks_production",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub data_dir: PathBuf,
    pub database: DatabaseConfig,
    pub blob: BlobConfig,
    pub generator: GeneratorConfig,
    pub embedding: EmbeddingConfig,
    pub rerank: RerankConfig,
    pub chunking: ChunkingConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub min_connections: u32,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub public_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub api_key: String,
    pub model: String,
    pub endpoint: String,
    pub timeout_secs: u64,
    pub answer_max_tokens: u32,
    pub history_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model_dir: PathBuf,
    pub dimension: usize,
    pub hosted_url: String,
    pub hosted_token: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    pub model_dir: PathBuf,
    pub hosted_api_key: String,
    pub hosted_model: String,
    /// Cross-encoder cutoff. Calibrated for the local model; hosted
    /// deployments typically raise it.
    pub min_score: f32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Token budget per chunk for the layout-aware chunker.
    pub token_budget: usize,
    pub overlap: usize,
    /// Sibling paragraphs shorter than this merge into the previous chunk.
    pub merge_under_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub rrf_k: usize,
    pub dense_score_threshold: f32,
    pub default_top_k: usize,
    pub default_top_n: usize,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl AppConfig {
    /// Build the configuration from the process environment, loading a
    /// `.env` file first when one exists.
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("tutor-rag")
            });

        let model_dir = std::env::var("MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let config = Self {
            environment: Environment::from_env(),
            data_dir,
            database: DatabaseConfig {
                host: env_or("DB_HOST", "localhost"),
                port: env_or("DB_PORT", "5432").parse().unwrap_or(5432),
                name: env_or("DB_NAME", "tutor_rag"),
                user: env_or("DB_USER", "postgres"),
                password: env_or("DB_PASSWORD", ""),
                min_connections: 5,
                max_connections: 20,
            },
            blob: BlobConfig {
                endpoint: env_or("S3_ENDPOINT", "localhost:9000"),
                access_key: env_or("S3_ACCESS_KEY", ""),
                secret_key: env_or("S3_SECRET_KEY", ""),
                bucket: env_or("S3_BUCKET_NAME", "chunk-images"),
                public_url: env_or("S3_PUBLIC_URL", "http://localhost:9000"),
            },
            generator: GeneratorConfig {
                api_key: env_or("OPENAI_API_KEY", ""),
                model: env_or("SUMMARIZER_MODEL_NAME", "gpt-4o-mini"),
                endpoint: env_or(
                    "GENERATOR_ENDPOINT",
                    "https://api.openai.com/v1/chat/completions",
                ),
                timeout_secs: 90,
                answer_max_tokens: env_or("ANSWER_MAX_TOKENS", "3000").parse().unwrap_or(3000),
                history_limit: env_or("CHAT_HISTORY_LIMIT", "6").parse().unwrap_or(6),
            },
            embedding: EmbeddingConfig {
                model_dir: model_dir.clone(),
                dimension: env_or("EMBEDDING_DIMENSION", "1024").parse().unwrap_or(1024),
                hosted_url: env_or("HF_SOLON_URL", ""),
                hosted_token: env_or("HF_TOKEN", ""),
                timeout_secs: 60,
            },
            rerank: RerankConfig {
                model_dir,
                hosted_api_key: env_or("COHERE_API_KEY", ""),
                hosted_model: env_or("HOSTED_RERANK_MODEL", "rerank-multilingual-v3.0"),
                min_score: env_or("MIN_RERANK_SCORE", "0.01").parse().unwrap_or(0.01),
                timeout_secs: 60,
            },
            chunking: ChunkingConfig {
                token_budget: env_or("CHUNK_SIZE", "1500").parse().unwrap_or(1500),
                overlap: env_or("CHUNK_OVERLAP", "150").parse().unwrap_or(150),
                merge_under_chars: 500,
            },
            search: SearchConfig {
                rrf_k: 60,
                dense_score_threshold: 0.05,
                default_top_k: 30,
                default_top_n: 15,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if self.chunking.token_budget < 100 {
            return Err("chunking.token_budget must be >= 100".into());
        }
        if self.chunking.overlap >= self.chunking.token_budget {
            return Err("chunking.overlap must be < token_budget".into());
        }
        if self.database.min_connections > self.database.max_connections {
            return Err("database.min_connections must be <= max_connections".into());
        }
        if !(0.0..=1.0).contains(&self.search.dense_score_threshold) {
            return Err("search.dense_score_threshold must be in [0.0, 1.0]".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStyle {
    Light,
    Verbose,
    Reasoning,
}

/// Chunking mode for a benchmark run: the layout-aware chunker with its
/// automatic structure, or the recursive splitter at a fixed size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ChunkMode {
    LayoutAuto,
    Recursive { chunk_size: usize, overlap: usize },
}

/// One entry of the benchmark knob table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    pub top_k: usize,
    pub top_n: usize,
    pub prompt_style: PromptStyle,
    pub chunk_mode: ChunkMode,
}

/// Canonical A/B knob table. Entries are part of the declared benchmark
/// set and must not be edited without re-running the full benchmark suite.
pub fn bench_config(config_id: &str) -> BenchConfig {
    use ChunkMode::{LayoutAuto, Recursive};
    use PromptStyle::{Light, Reasoning, Verbose};

    let entry = |top_k, top_n, prompt_style, chunk_mode| BenchConfig {
        top_k,
        top_n,
        prompt_style,
        chunk_mode,
    };

    match config_id {
        "01" => entry(30, 15, Light, LayoutAuto),
        "02" => entry(30, 15, Verbose, LayoutAuto),
        "03" => entry(50, 15, Light, LayoutAuto),
        "04" => entry(
            50,
            20,
            Light,
            Recursive {
                chunk_size: 1000,
                overlap: 100,
            },
        ),
        "05" => entry(
            30,
            15,
            Verbose,
            Recursive {
                chunk_size: 1500,
                overlap: 150,
            },
        ),
        "06" => entry(
            80,
            13,
            Verbose,
            Recursive {
                chunk_size: 2500,
                overlap: 250,
            },
        ),
        "07" => entry(50, 15, Reasoning, LayoutAuto),
        "08" => entry(80, 13, Verbose, LayoutAuto),
        "09" => entry(
            40,
            15,
            Light,
            Recursive {
                chunk_size: 1000,
                overlap: 100,
            },
        ),
        "10" => entry(
            50,
            15,
            Reasoning,
            Recursive {
                chunk_size: 1500,
                overlap: 150,
            },
        ),
        "11" => entry(
            60,
            15,
            Verbose,
            Recursive {
                chunk_size: 1500,
                overlap: 150,
            },
        ),
        _ => bench_config("01"),
    }
}
