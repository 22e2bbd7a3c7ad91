//! Shared constants for the relay: provider ids, endpoints and default chains.

use std::collections::HashMap;
use std::time::Duration;

use crate::core::Capability;

pub const OPENROUTER: &str = "openrouter";
pub const GEMINI_TEXT: &str = "gemini-text";
pub const OPENAI: &str = "openai";
pub const FAL_FLUX: &str = "fal-flux";
pub const GEMINI_IMAGEN: &str = "gemini-imagen";
pub const GEMINI_FLASH_IMAGE: &str = "gemini-flash-image";
pub const LUMA: &str = "luma";
pub const RUNWAY: &str = "runway";
pub const FAL_VIDEO: &str = "fal-video";
pub const VEO: &str = "veo";
pub const ELEVENLABS: &str = "elevenlabs";
pub const GEMINI_TTS: &str = "gemini-tts";

pub const OPENROUTER_KEY: &str = "OPENROUTER_API_KEY";
pub const GEMINI_KEY: &str = "GEMINI_API_KEY";
pub const OPENAI_KEY: &str = "OPENAI_API_KEY";
pub const FAL_KEY: &str = "FAL_API_KEY";
pub const LUMA_KEY: &str = "LUMA_API_KEY";
pub const RUNWAY_KEY: &str = "RUNWAY_API_KEY";
pub const ELEVENLABS_KEY: &str = "ELEVENLABS_API_KEY";
pub const IMGBB_KEY: &str = "IMGBB_API_KEY";

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const OPENROUTER_MODEL: &str = "anthropic/claude-3.5-sonnet";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENAI_MODEL: &str = "gpt-4.1-mini";

pub const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const GEMINI_TEXT_MODEL: &str = "gemini-2.5-flash";
pub const GEMINI_IMAGEN_MODEL: &str = "imagen-4.0-generate-001";
pub const GEMINI_FLASH_IMAGE_MODEL: &str = "gemini-2.0-flash-exp-image-generation";
pub const GEMINI_TTS_MODEL: &str = "gemini-2.5-flash-preview-tts";
pub const VEO_MODEL: &str = "veo-3.1-generate-preview";

pub const FAL_RUN_BASE: &str = "https://fal.run";
pub const FAL_QUEUE_BASE: &str = "https://queue.fal.run";
pub const FAL_IMAGE_MODEL: &str = "fal-ai/flux/dev";
pub const FAL_VIDEO_MODEL: &str = "fal-ai/kling-video/v1.6/standard/text-to-video";

pub const LUMA_BASE: &str = "https://api.lumalabs.ai/dream-machine/v1";
pub const LUMA_MODEL: &str = "ray-2";

pub const RUNWAY_BASE: &str = "https://api.dev.runwayml.com/v1";
pub const RUNWAY_MODEL: &str = "gen3a_turbo";
pub const RUNWAY_API_VERSION: &str = "2024-11-06";

pub const ELEVENLABS_BASE: &str = "https://api.elevenlabs.io/v1";
pub const ELEVENLABS_MODEL: &str = "eleven_multilingual_v2";
pub const ELEVENLABS_DEFAULT_VOICE: &str = "21m00Tcm4TlvDq8ikWAM";
pub const GEMINI_DEFAULT_VOICE: &str = "Charon";

pub const IMGBB_UPLOAD_URL: &str = "https://api.imgbb.com/1/upload";

pub const DEFAULT_MAX_WORKERS: usize = 3;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_INITIAL: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_STEP: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_MAX: Duration = Duration::from_secs(30);
pub const DEFAULT_VIDEO_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(120);

pub fn default_priorities() -> HashMap<Capability, Vec<String>> {
    let chain = |ids: &[&str]| ids.iter().map(|id| id.to_string()).collect::<Vec<_>>();
    HashMap::from([
        (Capability::Text, chain(&[OPENROUTER, GEMINI_TEXT, OPENAI])),
        (
            Capability::Image,
            chain(&[FAL_FLUX, GEMINI_IMAGEN, GEMINI_FLASH_IMAGE]),
        ),
        (Capability::Video, chain(&[LUMA, RUNWAY, FAL_VIDEO, VEO])),
        (Capability::Speech, chain(&[ELEVENLABS, GEMINI_TTS])),
    ])
}

pub fn default_job_timeout(capability: Capability) -> Duration {
    match capability {
        Capability::Video => DEFAULT_VIDEO_TIMEOUT,
        _ => DEFAULT_JOB_TIMEOUT,
    }
}
