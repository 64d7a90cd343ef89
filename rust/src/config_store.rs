use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::PathBuf;
use toml::map::Map;
use toml::Value;

use crate::backend::HttpBackendConfig;
use crate::dimensions::AspectRatio;
use crate::orchestrator::{CallPlan, DispatchPlan, PayloadPick};
use crate::MAX_IMAGE_COUNT;

pub const DEFAULT_ENDPOINT: &str = "https://backend.craiyon.com/generate";
pub const API_KEY_ENV: &str = "HF_TOKEN";

const DEFAULT_ASPECT_RATIOS: [&str; 3] = ["1/1", "16/9", "9/16"];

const DEFAULT_EXAMPLE_PROMPTS: [&str; 10] = [
    "A futuristic city skyline at sunset, with flying cars and neon lights reflecting off glass skyscrapers",
    "A peaceful Japanese village during cherry blossom season, with Mt. Fuji in the background and a river flowing through",
    "A magical forest with glowing mushrooms, floating lanterns, and a small wooden cottage in the middle",
    "Cyberpunk girl with purple hair and a robotic arm, standing in a rainy street lit by holographic ads",
    "A surreal desert landscape with floating islands, giant hourglasses, and a lone traveler on a camel",
    "An astronaut exploring an alien planet with blue vegetation, three moons in the sky, and crystal-like mountains",
    "An ancient library filled with floating books, spiral staircases, and golden glowing runes on the walls",
    "Cute cat wearing a wizard hat, casting spells in a cozy potion lab surrounded by candles and scrolls",
    "A steampunk-style airship flying over a Victorian-era city, with smoke rising from chimneys and clock towers",
    "A dramatic ocean wave frozen in time, with a surfer mid-air, and glowing jellyfish swimming inside the wave",
];

/// `config.toml`, normalized on load and written back with defaults filled in.
#[derive(Debug)]
pub struct ConfigStore {
    pub path: PathBuf,
    doc: Value,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let doc = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("failed to parse TOML: {}", path.display()))?
        } else {
            Value::Table(Map::new())
        };

        let mut store = Self { path, doc };
        store.normalize_doc();
        store.save()?;
        Ok(store)
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config dir: {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(&self.doc).context("failed to serialize TOML")?;
        fs::write(&self.path, text)
            .with_context(|| format!("failed to write config: {}", self.path.display()))
    }

    pub fn server_port(&self) -> u16 {
        self.app_table()
            .and_then(|t| t.get("server_port"))
            .and_then(value_to_i64)
            .and_then(|v| u16::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(3000)
    }

    pub fn max_images(&self) -> usize {
        self.app_table()
            .and_then(|t| t.get("max_images"))
            .and_then(value_to_i64)
            .and_then(|v| usize::try_from(v).ok())
            .map(|v| v.clamp(1, MAX_IMAGE_COUNT))
            .unwrap_or(4)
    }

    pub fn default_count(&self) -> usize {
        self.app_table()
            .and_then(|t| t.get("default_count"))
            .and_then(value_to_i64)
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(1)
            .clamp(1, self.max_images())
    }

    pub fn aspect_ratios(&self) -> Vec<String> {
        let ratios = normalize_ratios_from_value(self.app_table().and_then(|t| t.get("aspect_ratios")));
        if ratios.is_empty() {
            return DEFAULT_ASPECT_RATIOS.iter().map(|r| r.to_string()).collect();
        }
        ratios
    }

    pub fn default_aspect_ratio(&self) -> String {
        let ratios = self.aspect_ratios();
        self.app_table()
            .and_then(|t| t.get("default_aspect_ratio"))
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse::<AspectRatio>().ok())
            .map(|ratio| ratio.to_string())
            .filter(|ratio| ratios.contains(ratio))
            .or_else(|| ratios.first().cloned())
            .unwrap_or_else(|| "1/1".to_string())
    }

    pub fn example_prompts(&self) -> Vec<String> {
        let prompts = normalize_texts_from_value(self.app_table().and_then(|t| t.get("example_prompts")));
        if prompts.is_empty() {
            return DEFAULT_EXAMPLE_PROMPTS.iter().map(|p| p.to_string()).collect();
        }
        prompts
    }

    pub fn endpoint(&self) -> String {
        self.backend_table()
            .and_then(|t| t.get("endpoint"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_ENDPOINT)
            .to_string()
    }

    /// Configured key, else `HF_TOKEN` from the environment.
    pub fn api_key(&self) -> Option<String> {
        let configured = self
            .backend_table()
            .and_then(|t| t.get("api_key"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        resolve_api_key(configured, env::var(API_KEY_ENV).ok())
    }

    pub fn base_size(&self) -> u32 {
        self.backend_table()
            .and_then(|t| t.get("base_size"))
            .and_then(value_to_i64)
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| (64..=4096).contains(v))
            .unwrap_or(512)
    }

    pub fn call_plan(&self) -> CallPlan {
        self.backend_table()
            .and_then(|t| t.get("call_plan"))
            .and_then(Value::as_str)
            .and_then(CallPlan::parse)
            .unwrap_or_default()
    }

    pub fn payload_pick(&self) -> PayloadPick {
        self.backend_table()
            .and_then(|t| t.get("payload_pick"))
            .and_then(Value::as_str)
            .and_then(PayloadPick::parse)
            .unwrap_or_default()
    }

    pub fn images_field(&self) -> String {
        self.backend_table()
            .and_then(|t| t.get("images_field"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("images")
            .to_string()
    }

    pub fn send_dimensions(&self) -> bool {
        self.backend_table()
            .and_then(|t| t.get("send_dimensions"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn dispatch_plan(&self) -> DispatchPlan {
        DispatchPlan {
            call_plan: self.call_plan(),
            payload_pick: self.payload_pick(),
            base_size: self.base_size(),
        }
    }

    pub fn http_backend_config(&self) -> HttpBackendConfig {
        HttpBackendConfig {
            endpoint: self.endpoint(),
            api_key: self.api_key(),
            images_field: self.images_field(),
            send_dimensions: self.send_dimensions(),
        }
    }

    fn normalize_doc(&mut self) {
        if !self.doc.is_table() {
            self.doc = Value::Table(Map::new());
        }

        let server_port = i64::from(self.server_port());
        let max_images = self.max_images();
        let default_count = self.default_count();
        let aspect_ratios = self.aspect_ratios();
        let default_aspect_ratio = self.default_aspect_ratio();
        let example_prompts = self.example_prompts();
        {
            let app = self.ensure_table_mut("app");
            app.insert("server_port".to_string(), Value::Integer(server_port));
            app.insert("max_images".to_string(), Value::Integer(max_images as i64));
            app.insert(
                "default_count".to_string(),
                Value::Integer(default_count as i64),
            );
            app.insert(
                "default_aspect_ratio".to_string(),
                Value::String(default_aspect_ratio),
            );
            app.insert("aspect_ratios".to_string(), texts_to_value(&aspect_ratios));
            app.insert(
                "example_prompts".to_string(),
                texts_to_value(&example_prompts),
            );
        }

        let endpoint = self.endpoint();
        let api_key = self
            .backend_table()
            .and_then(|t| t.get("api_key"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let base_size = i64::from(self.base_size());
        let call_plan = self.call_plan();
        let payload_pick = self.payload_pick();
        let images_field = self.images_field();
        let send_dimensions = self.send_dimensions();
        {
            let backend = self.ensure_table_mut("backend");
            backend.insert("endpoint".to_string(), Value::String(endpoint));
            backend.insert("api_key".to_string(), Value::String(api_key));
            backend.insert("base_size".to_string(), Value::Integer(base_size));
            backend.insert(
                "call_plan".to_string(),
                Value::String(call_plan.as_str().to_string()),
            );
            backend.insert(
                "payload_pick".to_string(),
                Value::String(payload_pick.as_str().to_string()),
            );
            backend.insert("images_field".to_string(), Value::String(images_field));
            backend.insert(
                "send_dimensions".to_string(),
                Value::Boolean(send_dimensions),
            );
        }
    }

    fn app_table(&self) -> Option<&Map<String, Value>> {
        self.root_table("app")
    }

    fn backend_table(&self) -> Option<&Map<String, Value>> {
        self.root_table("backend")
    }

    fn root_table(&self, key: &str) -> Option<&Map<String, Value>> {
        self.doc
            .as_table()
            .and_then(|root| root.get(key))
            .and_then(Value::as_table)
    }

    fn ensure_table_mut(&mut self, key: &str) -> &mut Map<String, Value> {
        if !self.doc.is_table() {
            self.doc = Value::Table(Map::new());
        }
        let root = self
            .doc
            .as_table_mut()
            .expect("root should be table after normalization");
        let table = root
            .entry(key.to_string())
            .or_insert_with(|| Value::Table(Map::new()));
        if !table.is_table() {
            *table = Value::Table(Map::new());
        }
        table
            .as_table_mut()
            .expect("table should exist after normalization")
    }
}

fn resolve_api_key(configured: &str, from_env: Option<String>) -> Option<String> {
    let configured = configured.trim();
    if !configured.is_empty() {
        return Some(configured.to_string());
    }
    from_env
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn normalize_ratios_from_value(value: Option<&Value>) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::new();
    for text in normalize_texts_from_value(value) {
        let Ok(ratio) = text.parse::<AspectRatio>() else {
            continue;
        };
        let canonical = ratio.to_string();
        if !normalized.contains(&canonical) {
            normalized.push(canonical);
        }
    }
    normalized
}

fn normalize_texts_from_value(value: Option<&Value>) -> Vec<String> {
    let mut normalized = Vec::new();
    if let Some(Value::Array(items)) = value {
        for item in items {
            let text = value_to_text(item).trim().to_string();
            if !text.is_empty() && !normalized.iter().any(|existing| existing == &text) {
                normalized.push(text);
            }
        }
    }
    normalized
}

fn texts_to_value(texts: &[String]) -> Value {
    Value::Array(texts.iter().cloned().map(Value::String).collect())
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(v) => v.clone(),
        Value::Integer(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Boolean(v) => v.to_string(),
        Value::Datetime(v) => v.to_string(),
        Value::Array(v) => format!("{:?}", v),
        Value::Table(v) => format!("{:?}", v),
    }
}

fn value_to_i64(value: &Value) -> Option<i64> {
    value
        .as_integer()
        .or_else(|| value.as_float().map(|v| v as i64))
        .or_else(|| value.as_str().and_then(|v| v.trim().parse::<i64>().ok()))
}
