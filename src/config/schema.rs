//! Settings schema
//!
//! Every field has a statically known default, so a [`Settings`] value is
//! always complete in memory even when the file it was read from is partial.
//! Keys that the schema does not know are carried in [`Settings::extra`]
//! untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::{self, FlatMap};
use crate::errors::{PersistError, PersistResult};

pub const DEFAULT_PROMPT: &str = "Rules:
- You can analyze/view/show/access videos to the user by putting .mp4 files in a code block (we'll render it) like this: `/users/video.mp4`, use the exact, absolute, file path from file_path property
- Do not try to embed video in links (e.g. [](.mp4) or https://.mp4) instead put the file_path in a code block using backticks
- Always answer my question/intent, do not make up things
";

const IGNORED_WINDOWS_ALL_OS: &[&str] = &[
    "bit", "VPN", "Trash", "Private", "Incognito", "Wallpaper", "Settings", "Keepass",
    "Recorder", "Vaults", "OBS Studio", "screenpipe",
];

const IGNORED_WINDOWS_MACOS: &[&str] = &[
    ".env", "Item-0", "App Icon Window", "Battery", "Shortcuts", "WiFi", "BentoBox", "Clock",
    "Dock", "DeepL", "Control Center",
];

const IGNORED_WINDOWS_WINDOWS: &[&str] = &["Nvidia", "Control Panel", "System Properties"];

const IGNORED_WINDOWS_LINUX: &[&str] = &["Info center", "Discover", "Parted"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AiProviderType {
    NativeOllama,
    Openai,
    Custom,
    Embedded,
    ScreenpipeCloud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VadSensitivity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shortcut {
    ShowScreenpipe,
    StartRecording,
    StopRecording,
}

/// Local LLM sidecar configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddedLlmConfig {
    pub enabled: bool,
    pub model: String,
    pub port: u16,
}

impl Default for EmbeddedLlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: "llama3.2:1b-instruct-q4_K_M".to_string(),
            port: 11434,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credits {
    pub amount: f64,
}

/// Account fields, all optional until a login fills them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clerk_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits: Option<Credits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_connected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_subscribed: Option<bool>,
}

/// Provider branch of an AI preset, discriminated by `provider`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "kebab-case")]
pub enum AiPresetProvider {
    Openai {
        #[serde(rename = "apiKey")]
        api_key: String,
    },
    NativeOllama,
    ScreenpipeCloud,
    Custom {
        #[serde(rename = "apiKey", default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiPreset {
    pub id: String,
    pub max_context_chars: u64,
    pub url: String,
    pub model: String,
    pub default_preset: bool,
    pub prompt: String,
    #[serde(flatten)]
    pub provider: AiPresetProvider,
}

/// Complete user settings object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub openai_api_key: String,
    pub deepgram_api_key: String,
    pub ai_model: String,
    pub user_id: String,
    pub custom_prompt: String,
    pub dev_mode: bool,
    pub audio_transcription_engine: String,
    pub ocr_engine: String,
    pub monitor_ids: Vec<String>,
    pub audio_devices: Vec<String>,
    pub use_pii_removal: bool,
    pub restart_interval: u64,
    pub port: u16,
    pub data_dir: String,
    pub disable_audio: bool,
    pub ignored_windows: Vec<String>,
    pub included_windows: Vec<String>,
    pub ai_provider_type: AiProviderType,
    pub ai_url: String,
    pub ai_max_context_chars: u64,
    pub fps: f64,
    pub vad_sensitivity: VadSensitivity,
    pub analytics_enabled: bool,
    pub audio_chunk_duration: u64,
    pub use_chinese_mirror: bool,
    #[serde(rename = "embeddedLLM")]
    pub embedded_llm: EmbeddedLlmConfig,
    pub languages: Vec<String>,
    pub enable_beta: bool,
    pub is_first_time_user: bool,
    pub auto_start_enabled: bool,
    pub enable_frame_cache: bool,
    pub enable_ui_monitoring: bool,
    pub platform: String,
    pub disabled_shortcuts: Vec<Shortcut>,
    pub user: User,
    pub show_screenpipe_shortcut: String,
    pub start_recording_shortcut: String,
    pub stop_recording_shortcut: String,
    pub start_audio_shortcut: String,
    pub stop_audio_shortcut: String,
    pub pipe_shortcuts: BTreeMap<String, String>,
    pub enable_realtime_audio_transcription: bool,
    pub realtime_audio_transcription_engine: String,
    pub disable_vision: bool,
    pub use_all_monitors: bool,
    pub ai_presets: Vec<AiPreset>,
    pub enable_realtime_vision: bool,
    pub auto_update_pipes: bool,

    /// Keys present on disk that this schema does not describe. A
    /// `customSettings` entry is kept here but never written back.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::for_platform(std::env::consts::OS)
    }
}

impl Settings {
    /// Defaults for a given `std::env::consts::OS` value
    pub fn for_platform(os: &str) -> Self {
        let (ocr_engine, per_os_ignored): (&str, &[&str]) = match os {
            "macos" => ("apple-native", IGNORED_WINDOWS_MACOS),
            "windows" => ("windows-native", IGNORED_WINDOWS_WINDOWS),
            "linux" => ("tesseract", IGNORED_WINDOWS_LINUX),
            _ => ("tesseract", &[]),
        };
        let ignored_windows = IGNORED_WINDOWS_ALL_OS
            .iter()
            .chain(per_os_ignored)
            .map(|s| s.to_string())
            .collect();

        Self {
            openai_api_key: String::new(),
            deepgram_api_key: String::new(),
            ai_model: "gpt-4o".to_string(),
            user_id: String::new(),
            custom_prompt: DEFAULT_PROMPT.to_string(),
            dev_mode: false,
            audio_transcription_engine: "whisper-large-v3-turbo".to_string(),
            ocr_engine: ocr_engine.to_string(),
            monitor_ids: vec!["default".to_string()],
            audio_devices: vec!["default".to_string()],
            use_pii_removal: false,
            restart_interval: 0,
            port: 3030,
            data_dir: "default".to_string(),
            disable_audio: false,
            ignored_windows,
            included_windows: Vec::new(),
            ai_provider_type: AiProviderType::Openai,
            ai_url: "https://api.openai.com/v1".to_string(),
            ai_max_context_chars: 512_000,
            fps: 0.5,
            vad_sensitivity: VadSensitivity::High,
            analytics_enabled: true,
            audio_chunk_duration: 30,
            use_chinese_mirror: false,
            embedded_llm: EmbeddedLlmConfig::default(),
            languages: Vec::new(),
            enable_beta: false,
            is_first_time_user: true,
            auto_start_enabled: true,
            enable_frame_cache: true,
            enable_ui_monitoring: false,
            platform: os.to_string(),
            disabled_shortcuts: Vec::new(),
            user: User::default(),
            show_screenpipe_shortcut: "Super+Alt+S".to_string(),
            start_recording_shortcut: "Super+Alt+U".to_string(),
            stop_recording_shortcut: "Super+Alt+X".to_string(),
            start_audio_shortcut: String::new(),
            stop_audio_shortcut: String::new(),
            pipe_shortcuts: BTreeMap::new(),
            enable_realtime_audio_transcription: false,
            realtime_audio_transcription_engine: "deepgram".to_string(),
            disable_vision: false,
            use_all_monitors: false,
            ai_presets: Vec::new(),
            enable_realtime_vision: true,
            auto_update_pipes: false,
            extra: Map::new(),
        }
    }

    pub fn to_object(&self) -> PersistResult<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(object) => Ok(object),
            other => Err(PersistError::Serialization(format!(
                "settings serialized to a non-object value: {other}"
            ))),
        }
    }

    pub fn from_object(object: Map<String, Value>) -> PersistResult<Self> {
        Ok(serde_json::from_value(Value::Object(object))?)
    }

    /// Flatten into backing-store key paths
    pub fn flatten(&self) -> PersistResult<FlatMap> {
        Ok(codec::flatten(&self.to_object()?))
    }
}

/// Default values addressed by flat key path
#[derive(Debug, Clone)]
pub struct SchemaDefaults {
    nested: Value,
    flat: FlatMap,
}

impl SchemaDefaults {
    pub fn new(defaults: &Settings) -> PersistResult<Self> {
        let object = defaults.to_object()?;
        let flat = codec::flatten(&object);
        Ok(Self {
            nested: Value::Object(object),
            flat,
        })
    }

    /// Nested defaults object
    pub fn as_value(&self) -> &Value {
        &self.nested
    }

    pub fn settings(&self) -> PersistResult<Settings> {
        match &self.nested {
            Value::Object(object) => Settings::from_object(object.clone()),
            _ => Ok(Settings::default()),
        }
    }

    /// Whether `key` names a leaf or a nested object of the schema
    pub fn knows(&self, key: &str) -> bool {
        self.flat.contains_key(key) || codec::value_at(&self.nested, key).is_some()
    }

    /// Default for a flat key path. Keys the schema does not describe
    /// (optional fields, opaque extras) default to `null`.
    pub fn default_for_key(&self, key: &str) -> Value {
        self.flat
            .get(key)
            .or_else(|| codec::value_at(&self.nested, key))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_match_documented_values() {
        let settings = Settings::for_platform("linux");
        assert_eq!(settings.fps, 0.5);
        assert_eq!(settings.port, 3030);
        assert_eq!(settings.ocr_engine, "tesseract");
        assert_eq!(settings.platform, "linux");
        assert!(settings.ignored_windows.contains(&"Parted".to_string()));
        assert!(settings.ignored_windows.contains(&"VPN".to_string()));
    }

    #[test]
    fn test_platform_specific_ocr_engine() {
        assert_eq!(Settings::for_platform("macos").ocr_engine, "apple-native");
        assert_eq!(Settings::for_platform("windows").ocr_engine, "windows-native");
        assert_eq!(Settings::for_platform("freebsd").ocr_engine, "tesseract");
    }

    #[test]
    fn test_partial_object_fills_defaults() {
        let partial = json!({ "fps": 1.2, "embeddedLLM": { "port": 9000 } });
        let Value::Object(object) = partial else { unreachable!() };
        let settings = Settings::from_object(object).unwrap();
        assert_eq!(settings.fps, 1.2);
        assert_eq!(settings.embedded_llm.port, 9000);
        assert_eq!(settings.embedded_llm.model, "llama3.2:1b-instruct-q4_K_M");
        assert_eq!(settings.port, 3030);
    }

    #[test]
    fn test_unknown_keys_survive_round_trip() {
        let Value::Object(object) = json!({ "pluginState": { "theme": "dark" } }) else {
            unreachable!()
        };
        let settings = Settings::from_object(object).unwrap();
        assert_eq!(settings.extra.get("pluginState"), Some(&json!({ "theme": "dark" })));
        let flat = settings.flatten().unwrap();
        assert_eq!(flat.get("pluginState.theme"), Some(&json!("dark")));
    }

    #[test]
    fn test_wrong_type_is_serialization_error() {
        let Value::Object(object) = json!({ "port": "not a port" }) else { unreachable!() };
        let err = Settings::from_object(object).unwrap_err();
        assert!(matches!(err, PersistError::Serialization(_)));
    }

    #[test]
    fn test_ai_preset_tagged_union() {
        let preset: AiPreset = serde_json::from_value(json!({
            "id": "work",
            "maxContextChars": 128000,
            "url": "https://api.openai.com/v1",
            "model": "gpt-4o",
            "defaultPreset": true,
            "prompt": "",
            "provider": "openai",
            "apiKey": "sk-test"
        }))
        .unwrap();
        assert_eq!(
            preset.provider,
            AiPresetProvider::Openai { api_key: "sk-test".to_string() }
        );
        let back = serde_json::to_value(&preset).unwrap();
        assert_eq!(back["provider"], json!("openai"));
    }

    #[test]
    fn test_flatten_round_trips_settings() {
        let mut settings = Settings::for_platform("macos");
        settings.user.email = Some("ada@example.com".to_string());
        settings.pipe_shortcuts.insert("search".to_string(), "Super+K".to_string());
        settings.ai_presets.push(AiPreset {
            id: "local".to_string(),
            max_context_chars: 10_000,
            url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            default_preset: false,
            prompt: String::new(),
            provider: AiPresetProvider::NativeOllama,
        });
        let restored = Settings::from_object(codec::unflatten(&settings.flatten().unwrap())).unwrap();
        assert_eq!(restored, settings);
    }

    #[test]
    fn test_schema_defaults_lookup() {
        let defaults = SchemaDefaults::new(&Settings::for_platform("linux")).unwrap();
        assert_eq!(defaults.default_for_key("port"), json!(3030));
        assert_eq!(defaults.default_for_key("embeddedLLM.port"), json!(11434));
        assert_eq!(
            defaults.default_for_key("embeddedLLM"),
            json!({ "enabled": false, "model": "llama3.2:1b-instruct-q4_K_M", "port": 11434 })
        );
        assert_eq!(defaults.default_for_key("user"), json!({}));
        assert_eq!(defaults.default_for_key("user.email"), Value::Null);
        assert!(defaults.knows("embeddedLLM"));
        assert!(!defaults.knows("nonexistent"));
    }
}
