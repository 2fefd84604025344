//! Configuration for the conversation pipeline.
//!
//! All options come from environment variables (`SORI_*`) with sensible
//! defaults. The only required keys are the three collaborator API keys;
//! everything else falls back to the defaults below.

use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Top-level settings for the conversation pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Speech-to-text settings.
    pub stt: SttConfig,
    /// Language model settings.
    pub llm: LlmConfig,
    /// Text-to-speech settings.
    pub tts: TtsConfig,
    /// Memory extraction settings.
    pub memory: MemoryConfig,
    /// HTTP control surface settings.
    pub server: ServerConfig,
    /// Session timers and turn limits.
    pub session: SessionConfig,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Input device index (None = system default).
    pub mic_device_index: Option<usize>,
    /// Input sample rate in Hz.
    pub input_sample_rate: u32,
    /// Output sample rate in Hz (matches the TTS output format).
    pub output_sample_rate: u32,
    /// Microphone frame size in samples (~32ms at 16kHz).
    pub frame_samples: usize,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            mic_device_index: None,
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_samples: 512,
            output_device: None,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// Detection threshold while the assistant is quiet (0.0 - 1.0).
    pub threshold: f32,
    /// Elevated threshold while the assistant is speaking, so that
    /// speaker bleed does not trigger a self-interruption.
    pub threshold_speaking: f32,
    /// Consecutive supra-threshold frames required to report speech.
    pub speech_frames: u32,
    /// Consecutive sub-threshold frames required to release.
    pub release_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            threshold_speaking: 0.8,
            speech_frames: 3,
            release_frames: 5,
        }
    }
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// WebSocket endpoint of the streaming recognizer.
    pub url: String,
    /// API key sent as a query parameter on connect.
    pub api_key: String,
    /// BCP-47 language code requested from the recognizer.
    pub language: String,
    /// Keep the socket warm across ACTIVE -> IDLE instead of closing it.
    pub keep_warm: bool,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            url: "wss://stt.example.com/v1/listen".to_owned(),
            api_key: String::new(),
            language: "ko".to_owned(),
            keep_warm: true,
        }
    }
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the messages API.
    pub base_url: String,
    /// API key for the messages API.
    pub api_key: String,
    /// Model identifier.
    pub model: String,
    /// Maximum tokens to generate per response.
    pub max_tokens: u32,
    /// Reasoning effort hint ("low", "medium", "high").
    pub effort: String,
    /// Persona prompt file; falls back to a built-in persona when unset.
    pub persona_path: Option<PathBuf>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_owned(),
            api_key: String::new(),
            model: "claude-sonnet-4-5".to_owned(),
            max_tokens: 1500,
            effort: "medium".to_owned(),
            persona_path: None,
        }
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Base URL of the synthesis API.
    pub base_url: String,
    /// API key for the synthesis API.
    pub api_key: String,
    /// Voice identifier.
    pub voice_id: String,
    /// Output format label sent to the API (raw PCM variants only).
    pub output_format: String,
    /// Short line spoken when a turn fails mid-stream.
    pub apology_text: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://tts.example.com".to_owned(),
            api_key: String::new(),
            voice_id: "default".to_owned(),
            output_format: "pcm_24000".to_owned(),
            apology_text: "죄송해요, 잠깐 문제가 생겼어요.".to_owned(),
        }
    }
}

/// Memory extraction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Whether memory extraction runs at all.
    pub enabled: bool,
    /// Model used for entity extraction (cheaper than the dialog model).
    pub extraction_model: String,
    /// Token budget for the retrieved-context block.
    pub context_target_tokens: usize,
    /// Directory for the JSONL memory records.
    pub data_dir: PathBuf,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extraction_model: "claude-haiku-4-5".to_owned(),
            context_target_tokens: 3000,
            data_dir: default_data_dir().join("memory"),
        }
    }
}

/// HTTP control surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Expose the `/memory` process snapshot endpoint.
    pub memory_endpoint: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 4710,
            memory_endpoint: false,
        }
    }
}

/// Session timers and turn limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds of silence in ACTIVE before returning to IDLE.
    pub active_timeout_secs: u64,
    /// Maximum tool iterations per turn.
    pub max_tool_iterations: u32,
    /// Sentence-buffer overflow guard in characters.
    pub max_buffer_chars: usize,
    /// Number of turns in the sliding window sent to the LLM.
    pub window_turns: usize,
    /// Directory for daily conversation logs.
    pub conversation_log_dir: PathBuf,
    /// Export the day's log as CSV on clean shutdown.
    pub export_csv_on_shutdown: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            active_timeout_secs: 30,
            max_tool_iterations: 3,
            max_buffer_chars: 2000,
            window_turns: 20,
            conversation_log_dir: default_data_dir().join("conversations"),
            export_csv_on_shutdown: false,
        }
    }
}

/// Returns the default data directory (`$XDG_DATA_HOME/sori` or `~/.sori`).
fn default_data_dir() -> PathBuf {
    if let Some(data) = std::env::var_os("XDG_DATA_HOME") {
        PathBuf::from(data).join("sori")
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".sori")
    } else {
        PathBuf::from("/tmp/sori")
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| VoiceError::Config(format!("invalid value for {name}: {raw:?}"))),
        None => Ok(default),
    }
}

fn require(name: &str) -> Result<String> {
    env_var(name).ok_or_else(|| VoiceError::Config(format!("{name} is required")))
}

impl Settings {
    /// Load settings from the environment.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error when a required key is missing or a value
    /// fails to parse. Callers treat this as fatal at startup.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let audio = AudioConfig {
            mic_device_index: match env_var("SORI_MIC_DEVICE_INDEX") {
                Some(raw) => Some(raw.parse().map_err(|_| {
                    VoiceError::Config(format!("invalid value for SORI_MIC_DEVICE_INDEX: {raw:?}"))
                })?),
                None => None,
            },
            input_sample_rate: env_parse("SORI_SAMPLE_RATE", defaults.audio.input_sample_rate)?,
            output_sample_rate: env_parse(
                "SORI_OUTPUT_SAMPLE_RATE",
                defaults.audio.output_sample_rate,
            )?,
            frame_samples: env_parse("SORI_FRAME_SAMPLES", defaults.audio.frame_samples)?,
            output_device: env_var("SORI_OUTPUT_DEVICE"),
        };

        let vad = VadConfig {
            threshold: env_parse("SORI_VAD_THRESHOLD", defaults.vad.threshold)?,
            threshold_speaking: env_parse(
                "SORI_VAD_THRESHOLD_SPEAKING",
                defaults.vad.threshold_speaking,
            )?,
            speech_frames: env_parse("SORI_VAD_SPEECH_FRAMES", defaults.vad.speech_frames)?,
            release_frames: env_parse("SORI_VAD_RELEASE_FRAMES", defaults.vad.release_frames)?,
        };

        let stt = SttConfig {
            url: env_var("SORI_STT_URL").unwrap_or(defaults.stt.url),
            api_key: require("SORI_STT_API_KEY")?,
            language: env_var("SORI_STT_LANGUAGE").unwrap_or(defaults.stt.language),
            keep_warm: env_parse("SORI_STT_KEEP_WARM", defaults.stt.keep_warm)?,
        };

        let llm = LlmConfig {
            base_url: env_var("SORI_LLM_BASE_URL").unwrap_or(defaults.llm.base_url),
            api_key: require("SORI_LLM_API_KEY")?,
            model: env_var("SORI_LLM_MODEL").unwrap_or(defaults.llm.model),
            max_tokens: env_parse("SORI_LLM_MAX_TOKENS", defaults.llm.max_tokens)?,
            effort: env_var("SORI_LLM_EFFORT").unwrap_or(defaults.llm.effort),
            persona_path: env_var("SORI_PERSONA_PATH").map(PathBuf::from),
        };

        let tts = TtsConfig {
            base_url: env_var("SORI_TTS_BASE_URL").unwrap_or(defaults.tts.base_url),
            api_key: require("SORI_TTS_API_KEY")?,
            voice_id: env_var("SORI_TTS_VOICE_ID").unwrap_or(defaults.tts.voice_id),
            output_format: env_var("SORI_TTS_OUTPUT_FORMAT").unwrap_or(defaults.tts.output_format),
            apology_text: env_var("SORI_APOLOGY_TEXT").unwrap_or(defaults.tts.apology_text),
        };

        let memory = MemoryConfig {
            enabled: env_parse("SORI_MEMORY_ENABLED", defaults.memory.enabled)?,
            extraction_model: env_var("SORI_MEMORY_EXTRACTION_MODEL")
                .unwrap_or(defaults.memory.extraction_model),
            context_target_tokens: env_parse(
                "SORI_RAG_TARGET_TOKENS",
                defaults.memory.context_target_tokens,
            )?,
            data_dir: env_var("SORI_MEMORY_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.memory.data_dir),
        };

        let server = ServerConfig {
            host: env_var("SORI_HTTP_HOST").unwrap_or(defaults.server.host),
            port: env_parse("SORI_HTTP_PORT", defaults.server.port)?,
            memory_endpoint: env_parse(
                "SORI_HTTP_MEMORY_ENDPOINT",
                defaults.server.memory_endpoint,
            )?,
        };

        let session = SessionConfig {
            active_timeout_secs: env_parse(
                "SORI_ACTIVE_TIMEOUT_SECS",
                defaults.session.active_timeout_secs,
            )?,
            max_tool_iterations: env_parse(
                "SORI_MAX_TOOL_ITERATIONS",
                defaults.session.max_tool_iterations,
            )?,
            max_buffer_chars: env_parse("SORI_MAX_BUFFER_CHARS", defaults.session.max_buffer_chars)?,
            window_turns: env_parse("SORI_WINDOW_TURNS", defaults.session.window_turns)?,
            conversation_log_dir: env_var("SORI_CONVERSATION_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.session.conversation_log_dir),
            export_csv_on_shutdown: env_parse(
                "SORI_EXPORT_CSV_ON_SHUTDOWN",
                defaults.session.export_csv_on_shutdown,
            )?,
        };

        Ok(Self {
            audio,
            vad,
            stt,
            llm,
            tts,
            memory,
            server,
            session,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_formats() {
        let s = Settings::default();
        assert_eq!(s.audio.input_sample_rate, 16_000);
        assert_eq!(s.audio.output_sample_rate, 24_000);
        assert_eq!(s.audio.frame_samples, 512);
        assert_eq!(s.session.max_tool_iterations, 3);
        assert_eq!(s.session.active_timeout_secs, 30);
        assert_eq!(s.session.max_buffer_chars, 2000);
    }

    #[test]
    fn speaking_threshold_is_elevated() {
        let v = VadConfig::default();
        assert!(v.threshold_speaking > v.threshold);
    }
}
