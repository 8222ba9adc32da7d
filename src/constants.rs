/// Application-wide constants for segmenting, audio assembly, and the worker pool

pub mod segmenting {
    /// Maximum number of characters the speech API accepts per request (limit is 4096)
    pub const MAX_SEGMENT_LENGTH: usize = 4000;
}

pub mod audio {
    /// Length of the silent placeholder substituted for a failed segment
    pub const PLACEHOLDER_SILENCE_MS: u64 = 1000;

    /// Sample rate of the speech API's PCM output, used when no segment tells us better
    pub const DEFAULT_SAMPLE_RATE: u32 = 24000;

    pub const DEFAULT_CHANNELS: u16 = 1;

    /// MPEG-1 rate for MP3 export; the 24 kHz MPEG-2 layer tops out at 160 kbps
    pub const MP3_SAMPLE_RATE: u32 = 44_100;

    /// Frames handed to the MP3 encoder per call
    pub const MP3_CHUNK_FRAMES: usize = 8192;
}

pub mod worker {
    /// Number of segments that may wait in the task queue ahead of the workers
    /// Producers block once the queue is full
    pub const MAX_PENDING_SEGMENTS: usize = 8;

    /// Upper bound accepted for the `max_workers` setting
    pub const MAX_WORKERS_LIMIT: usize = 32;
}

pub mod api {
    pub const SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";

    /// Environment variable consulted when settings.yaml has no API key
    pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

    /// Largest response body we accept for a single segment (50 MB)
    pub const MAX_RESPONSE_BYTES: u64 = 50 * 1024 * 1024;
}
