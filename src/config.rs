//! Configuração do Spectra carregada a partir de `spectra.toml`.
//!
//! A struct [`SpectraConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! Variáveis de ambiente têm precedência sobre o arquivo.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;
use url::Url;

/// Configuração de nível superior carregada de `spectra.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SpectraConfig {
    /// Chave da API Anthropic usada pela etapa de geração.
    #[serde(default)]
    pub api_key: String,

    /// Modelo usado para gerar os artefatos.
    #[serde(default = "default_model")]
    pub model: String,

    /// Limite de tokens da resposta do modelo.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Tempo máximo, em segundos, da etapa de geração.
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: f64,

    /// Endpoint Redis: URL completa (`redis://`, `rediss://`) ou apenas o host.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Senha do Redis, exigida quando `redis_url` não traz credenciais.
    #[serde(default)]
    pub redis_token: Option<String>,

    #[serde(default = "default_redis_connect_timeout_secs")]
    pub redis_connect_timeout_secs: u64,

    /// TTL dos registros de job, renovado a cada escrita.
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,

    /// Endereço de escuta do servidor HTTP.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Emite logs em JSON em vez de texto.
    #[serde(default)]
    pub log_json: bool,

    /// Origens CORS separadas por vírgula: `*`, `https://...` ou `regex:<padrão>`.
    #[serde(default)]
    pub cors_allowed_origins: String,

    /// Envia `Access-Control-Allow-Credentials`; ignorado com origem curinga.
    #[serde(default = "default_cors_allow_credentials")]
    pub cors_allow_credentials: bool,
}

fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_max_tokens() -> u32 {
    3000
}

fn default_llm_timeout_secs() -> f64 {
    120.0
}

fn default_redis_connect_timeout_secs() -> u64 {
    5
}

fn default_job_ttl_secs() -> u64 {
    3600
}

fn default_cors_allow_credentials() -> bool {
    true
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

impl Default for SpectraConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            llm_timeout_secs: default_llm_timeout_secs(),
            redis_url: None,
            redis_token: None,
            redis_connect_timeout_secs: default_redis_connect_timeout_secs(),
            job_ttl_secs: default_job_ttl_secs(),
            bind: default_bind(),
            log_json: false,
            cors_allowed_origins: String::new(),
            cors_allow_credentials: default_cors_allow_credentials(),
        }
    }
}

impl SpectraConfig {
    /// Carrega `spectra.toml` do diretório atual e aplica o ambiente do processo.
    pub fn load() -> Result<Self> {
        let mut config = Self::from_file(Path::new("spectra.toml"))?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Lê o arquivo indicado. Usa valores padrão se o arquivo não existir.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Sobrescreve campos com as variáveis de ambiente presentes e não vazias.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(key) = var("ANTHROPIC_API_KEY") {
            self.api_key = key;
        }
        if let Some(url) = var("UPSTASH_REDIS_URL") {
            self.redis_url = Some(url);
        }
        if let Some(token) = var("UPSTASH_REDIS_TOKEN") {
            self.redis_token = Some(token);
        }
        if let Some(raw) = var("LLM_TIMEOUT_SECONDS") {
            match raw.trim().parse::<f64>() {
                Ok(secs) if secs.is_finite() && secs > 0.0 => self.llm_timeout_secs = secs,
                _ => warn!(value = %raw, "ignoring invalid LLM_TIMEOUT_SECONDS"),
            }
        }
        if let Some(bind) = var("SPECTRA_BIND") {
            self.bind = bind;
        }
        if let Some(raw) = var("SPECTRA_LOG_JSON") {
            self.log_json = matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(origins) = var("CORS_ALLOWED_ORIGINS") {
            self.cors_allowed_origins = origins;
        }
        if let Some(raw) = var("CORS_ALLOW_CREDENTIALS") {
            self.cors_allow_credentials = raw.trim().eq_ignore_ascii_case("true");
        }
    }

    /// URL de conexão Redis efetiva, ou `None` para armazenamento em memória.
    ///
    /// Uma URL `redis://`/`rediss://` é usada como está; um host sem esquema
    /// exige o token, que vira a senha de uma conexão TLS.
    pub fn redis_connection_url(&self) -> Option<String> {
        let url = self.redis_url.as_deref()?.trim();
        if url.starts_with("redis://") || url.starts_with("rediss://") {
            return Some(url.to_string());
        }
        let Some(token) = self.redis_token.as_deref() else {
            warn!("UPSTASH_REDIS_TOKEN required when UPSTASH_REDIS_URL doesn't include credentials");
            return None;
        };
        let mut parsed = match Url::parse(&format!("rediss://{url}")) {
            Ok(parsed) if parsed.has_host() => parsed,
            _ => {
                warn!(host = %url, "ignoring invalid UPSTASH_REDIS_URL");
                return None;
            }
        };
        // Fails only for URLs that cannot carry credentials, excluded above.
        parsed.set_username("default").ok()?;
        parsed.set_password(Some(token)).ok()?;
        Some(parsed.to_string())
    }

    /// Timeout da geração; valores inválidos no arquivo voltam ao padrão.
    pub fn llm_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.llm_timeout_secs)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| Duration::from_secs_f64(default_llm_timeout_secs()))
    }
}
