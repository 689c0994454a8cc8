//! Preset descriptions for the synthetic sources and sinks used by scenarios

use rand::Rng;

use super::description::{Element, PipelineDescription};
use super::error::LaunchError;

/// Font used for labelling test sources
pub const LABEL_FONT: &str = "Sans 80";

/// Font used for the running-time overlay
pub const TIME_FONT: &str = "Verdana bold 50";

/// Highest `videotestsrc` pattern accepted
pub const MAX_PATTERN: u32 = 19;

/// Highest `audiotestsrc` wave accepted
pub const MAX_WAVE: u32 = 12;

fn check_port(port: u16) -> Result<u16, LaunchError> {
    if port == 0 {
        return Err(LaunchError::property("port", "must be in range 1 to 65535"));
    }
    Ok(port)
}

fn label_overlay(text: &str) -> Element {
    Element::new("textoverlay")
        .prop("font-desc", LABEL_FONT)
        .prop("auto-resize", true)
        .prop("shaded-background", true)
        .prop("text", text)
}

/// A synthetic video source pushing GDP-framed raw video to a TCP port
#[derive(Debug, Clone)]
pub struct VideoSource {
    pub port: u16,
    pub width: u32,
    pub height: u32,
    pub pattern: u32,
    pub label: Option<String>,
    pub time_overlay: bool,
    pub clock_overlay: bool,
}

impl VideoSource {
    pub fn new(port: u16, width: u32, height: u32) -> Self {
        Self {
            port,
            width,
            height,
            pattern: 0,
            label: None,
            time_overlay: true,
            clock_overlay: false,
        }
    }

    pub fn pattern(mut self, pattern: u32) -> Self {
        self.pattern = pattern;
        self
    }

    /// Pick a random pattern
    pub fn random_pattern<R: Rng>(self, rng: &mut R) -> Self {
        let pattern = rng.gen_range(0..=MAX_PATTERN);
        self.pattern(pattern)
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn clock_overlay(mut self, enabled: bool) -> Self {
        self.clock_overlay = enabled;
        self
    }

    pub fn build(&self) -> Result<PipelineDescription, LaunchError> {
        let port = check_port(self.port)?;
        if self.pattern > MAX_PATTERN {
            return Err(LaunchError::property(
                "pattern",
                format!("must be in range 0 to {}", MAX_PATTERN),
            ));
        }
        if self.width == 0 {
            return Err(LaunchError::property("width", "must be a positive value"));
        }
        if self.height == 0 {
            return Err(LaunchError::property("height", "must be a positive value"));
        }

        let mut desc = PipelineDescription::new()
            .element(Element::new("videotestsrc").prop("pattern", self.pattern))
            .caps(format!("video/x-raw,width={},height={}", self.width, self.height));
        if let Some(label) = &self.label {
            desc = desc.element(label_overlay(label));
        }
        if self.time_overlay {
            desc = desc.element(Element::new("timeoverlay").prop("font-desc", TIME_FONT));
        }
        if self.clock_overlay {
            desc = desc.element(Element::new("clockoverlay").prop("font-desc", TIME_FONT));
        }
        Ok(desc
            .element(Element::new("gdppay"))
            .element(Element::new("tcpclientsink").prop("port", port)))
    }
}

/// A synthetic audio source pushing GDP-framed raw audio to a TCP port
#[derive(Debug, Clone)]
pub struct AudioSource {
    pub port: u16,
    pub wave: Option<u32>,
}

impl AudioSource {
    pub fn new(port: u16) -> Self {
        Self { port, wave: None }
    }

    pub fn wave(mut self, wave: u32) -> Self {
        self.wave = Some(wave);
        self
    }

    pub fn random_wave<R: Rng>(self, rng: &mut R) -> Self {
        let wave = rng.gen_range(0..MAX_WAVE);
        self.wave(wave)
    }

    pub fn build(&self) -> Result<PipelineDescription, LaunchError> {
        let port = check_port(self.port)?;
        if let Some(wave) = self.wave {
            if wave > MAX_WAVE {
                return Err(LaunchError::property(
                    "wave",
                    format!("must be in range 0 to {}", MAX_WAVE),
                ));
            }
        }
        Ok(PipelineDescription::new()
            .element(Element::new("audiotestsrc").prop_opt("wave", self.wave))
            .element(Element::new("gdppay"))
            .element(Element::new("tcpclientsink").prop("port", port)))
    }
}

/// Sink reading a composed or preview video stream from the server
pub fn video_sink(port: u16, sink: &str) -> Result<PipelineDescription, LaunchError> {
    let port = check_port(port)?;
    Ok(PipelineDescription::new()
        .element(Element::new("tcpclientsrc").prop("port", port))
        .element(Element::new("gdpdepay"))
        .element(Element::new("videoconvert"))
        .element(Element::new(sink)))
}

/// Sink reading an audio preview stream and rendering it as a visualisation
pub fn audio_preview_sink(
    port: u16,
    label: &str,
    sink: &str,
) -> Result<PipelineDescription, LaunchError> {
    let port = check_port(port)?;
    Ok(PipelineDescription::new()
        .element(Element::new("tcpclientsrc").prop("port", port))
        .element(Element::new("gdpdepay"))
        .element(Element::new("faad"))
        .element(Element::new("goom2k1"))
        .element(label_overlay(label))
        .element(Element::new("videoconvert"))
        .element(Element::new(sink)))
}

/// Playback of a recording written by the server
pub fn recording_playback(
    location: &str,
    video_sink: &str,
    audio_sink: &str,
) -> PipelineDescription {
    PipelineDescription::new()
        .element(Element::new("filesrc").prop("location", location))
        .element(Element::new("avidemux").prop("name", "dm"))
        .branch("dm.audio_0")
        .element(Element::new("queue"))
        .element(Element::new("faad"))
        .element(Element::new("audioconvert"))
        .element(Element::new(audio_sink))
        .branch("dm.video_0")
        .element(Element::new("queue"))
        .element(Element::new("vp8dec"))
        .element(Element::new("videoconvert"))
        .element(Element::new(video_sink))
}

/// One video source split by a tee into two labelled streams sharing the
/// same running time, used to check timestamps across switches
pub fn timestamp_source(port: u16, width: u32, height: u32) -> Result<PipelineDescription, LaunchError> {
    let port = check_port(port)?;
    let mut desc = PipelineDescription::new()
        .element(Element::new("videotestsrc").prop("pattern", 0))
        .caps(format!("video/x-raw,width={},height={}", width, height))
        .element(Element::new("timeoverlay").prop("font-desc", TIME_FONT))
        .element(Element::new("tee").prop("name", "v"));
    for text in ["111", "222"] {
        desc = desc
            .branch("v.")
            .element(Element::new("queue"))
            .element(
                Element::new("textoverlay")
                    .prop("font-desc", "Sans 120")
                    .prop("text", text),
            )
            .element(Element::new("gdppay"))
            .element(Element::new("tcpclientsink").prop("port", port));
    }
    Ok(desc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_source_description() {
        let desc = VideoSource::new(3000, 1280, 720)
            .pattern(1)
            .label("source2")
            .build()
            .unwrap();

        assert_eq!(
            desc.as_str(),
            "videotestsrc pattern=1 ! video/x-raw,width=1280,height=720 ! \
             textoverlay font-desc=\"Sans 80\" auto-resize=true shaded-background=true text=source2 ! \
             timeoverlay font-desc=\"Verdana bold 50\" ! gdppay ! tcpclientsink port=3000"
        );
        assert!(desc.parse().is_ok());
    }

    #[test]
    fn test_video_source_rejects_bad_parameters() {
        assert!(VideoSource::new(0, 1280, 720).build().is_err());
        assert!(VideoSource::new(3000, 1280, 720).pattern(20).build().is_err());
        assert!(VideoSource::new(3000, 0, 720).build().is_err());
        assert!(VideoSource::new(3000, 1280, 0).build().is_err());
    }

    #[test]
    fn test_random_pattern_in_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let source = VideoSource::new(3000, 640, 480).random_pattern(&mut rng);
            assert!(source.pattern <= MAX_PATTERN);
            assert!(source.build().is_ok());
        }
    }

    #[test]
    fn test_audio_source_description() {
        let desc = AudioSource::new(4000).wave(2).build().unwrap();
        assert_eq!(
            desc.as_str(),
            "audiotestsrc wave=2 ! gdppay ! tcpclientsink port=4000"
        );

        let plain = AudioSource::new(4000).build().unwrap();
        assert_eq!(plain.as_str(), "audiotestsrc ! gdppay ! tcpclientsink port=4000");
    }

    #[test]
    fn test_sinks_parse() {
        let sink = video_sink(3003, "fakesink").unwrap();
        assert_eq!(
            sink.as_str(),
            "tcpclientsrc port=3003 ! gdpdepay ! videoconvert ! fakesink"
        );
        assert!(audio_preview_sink(3004, "audio1", "fakesink")
            .unwrap()
            .parse()
            .is_ok());
    }

    #[test]
    fn test_recording_playback_has_two_branches() {
        let graph = recording_playback("test-recording.data", "fakesink", "fakesink")
            .parse()
            .unwrap();
        assert_eq!(graph.chains.len(), 3);
        assert_eq!(
            graph.elements().next().unwrap().property("location"),
            Some("test-recording.data")
        );
    }

    #[test]
    fn test_timestamp_source_tees_to_one_port() {
        let graph = timestamp_source(3000, 1280, 720).unwrap().parse().unwrap();
        assert_eq!(graph.elements_of("tcpclientsink").count(), 2);
        assert!(graph
            .elements_of("tcpclientsink")
            .all(|sink| sink.property("port") == Some("3000")));
    }
}
