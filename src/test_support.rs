use std::path::PathBuf;

/// Write a 440 Hz sine WAV into the temp dir and return its path.
pub fn write_tone(name: &str, seconds: f32, sample_rate: u32, channels: u16) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "spectrum-player-{name}-{}.wav",
        std::process::id()
    ));
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).expect("create wav");
    let frames = (seconds * sample_rate as f32) as u32;
    for i in 0..frames {
        let t = i as f32 / sample_rate as f32;
        let s = (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.5;
        for _ in 0..channels {
            writer
                .write_sample((s * i16::MAX as f32) as i16)
                .expect("write sample");
        }
    }
    writer.finalize().expect("finalize wav");
    path
}
