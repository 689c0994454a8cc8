//! The named scenarios of the suite
//!
//! Lifetimes and ports come from [`HarnessConfig`]; warm-up and stagger
//! delays are fixed and scaled by `timings.delay_scale`. The fixed sleeps
//! stand in for a readiness signal the server does not offer, so a slow
//! machine can still fail a scenario.

use std::time::Duration;

use rand::Rng;

use super::artifact::Artifact;
use super::error::ScenarioError;
use super::expect::ControlExpectations;
use super::scheduler::{CaseSpec, Scenario, Stage, Worker};
use super::suite::{Category, SuiteOptions};
use crate::config::HarnessConfig;
use crate::control::ExpectedPorts;
use crate::pipeline::presets::{self, AudioSource, VideoSource};
use crate::pipeline::LaunchError;

/// Patterns of the three labelled video sources
const SOURCE_PATTERNS: [u32; 3] = [0, 1, 15];

/// Every scenario of the enabled categories, each followed by the cleanup
/// of the recording it leaves behind
pub fn suite<R: Rng>(
    config: &HarnessConfig,
    options: &SuiteOptions,
    rng: &mut R,
) -> Result<Vec<Scenario>, ScenarioError> {
    let mut scenarios = Vec::new();
    for category in Category::ALL {
        if !options.enabled(category) {
            continue;
        }
        match category {
            Category::Controller => scenarios.push(controller(config)?),
            Category::Video => {
                scenarios.push(video(config)?);
                scenarios.push(recording_result("video-recording-result", config));
            }
            Category::Audio => {
                scenarios.push(audio(config, options)?);
                scenarios.push(recording_result("audio-recording-result", config));
            }
            Category::UiIntegration => {
                scenarios.push(ui_integrated(config)?);
                scenarios.push(recording_result("recording-result", config));
            }
            Category::Switching => {
                scenarios.push(switching(config)?);
                scenarios.push(recording_result("recording-result", config));
            }
            Category::RandomConnection => {
                scenarios.push(random_connections(config, rng)?);
                scenarios.push(recording_result("recording-result", config));
            }
            Category::Fuzz => {
                scenarios.push(fuzz(config, rng)?);
                scenarios.push(recording_result("recording-result", config));
            }
            Category::CheckingTimestamps => {
                scenarios.push(checking_timestamps(config)?);
                scenarios.push(recording_result("recording-result", config));
            }
        }
    }
    Ok(scenarios)
}

fn delay(config: &HarnessConfig, millis: u64) -> Duration {
    config.timings.delay(millis)
}

fn video_source(config: &HarnessConfig) -> VideoSource {
    VideoSource::new(config.ports.video, config.video.width, config.video.height)
}

fn labelled_video(config: &HarnessConfig, n: usize, label: &str) -> VideoSource {
    video_source(config)
        .pattern(SOURCE_PATTERNS[n % SOURCE_PATTERNS.len()])
        .label(label)
}

fn record_location(config: &HarnessConfig) -> String {
    config.record_path.display().to_string()
}

/// One video and one audio source while a control session watches the
/// port assignments, then playback of the recording
pub fn controller(config: &HarnessConfig) -> Result<Scenario, LaunchError> {
    let lifetime = config.timings.controller_secs;
    let ports = config.ports;
    let expectations = ControlExpectations::new(ExpectedPorts {
        compose: ports.compose,
        encode: ports.encode,
    })
    .compose(ports.compose, 1)
    .audio(ports.preview(2), 1)
    .previews(vec![ports.preview(1), ports.preview(2)], 2);

    Ok(Scenario::new("controller")
        .with_server(delay(config, 1000))
        .with_control(expectations)
        .stage(Stage::sources(Duration::ZERO).case(CaseSpec::new(
            "test-video-source1",
            video_source(config).pattern(0).build()?,
            lifetime,
        )))
        .stage(Stage::sources(delay(config, 1000)).case(CaseSpec::new(
            "test-audio-source1",
            AudioSource::new(ports.audio).wave(2).build()?,
            lifetime,
        )))
        .artifact(Artifact::Exists(config.record_path.clone()))
        .after_teardown(CaseSpec::new(
            "play-test-record",
            presets::recording_playback(
                &record_location(config),
                &config.sinks.video,
                &config.sinks.audio,
            ),
            0,
        )))
}

/// Three video sources, the composite output and three previews
pub fn video(config: &HarnessConfig) -> Result<Scenario, LaunchError> {
    let lifetime = config.timings.video_secs;
    let ports = config.ports;
    let source = |n: usize| -> Result<CaseSpec, LaunchError> {
        Ok(CaseSpec::new(
            format!("test-video-source{}", n + 1),
            labelled_video(config, n, &format!("source{}", n + 1)).build()?,
            lifetime,
        ))
    };

    let mut sinks = Stage::sinks(delay(config, 1000)).case(CaseSpec::new(
        "test_video_compose_sink",
        presets::video_sink(ports.compose, &config.sinks.video)?,
        lifetime,
    ));
    for slot in 1..=3u16 {
        sinks = sinks.case(CaseSpec::new(
            format!("test_video_preview_sink{}", slot),
            presets::video_sink(ports.preview(slot), &config.sinks.video)?,
            lifetime,
        ));
    }

    Ok(Scenario::new("video")
        .with_server(delay(config, 2000))
        .stage(Stage::sources(Duration::ZERO).case(source(0)?))
        .stage(
            Stage::sources(delay(config, 1000))
                .case(source(1)?)
                .case(source(2)?),
        )
        .stage(sinks)
        .artifact(Artifact::Exists(config.record_path.clone())))
}

/// Three audio sources and, unless the UI is external, their previews
pub fn audio(config: &HarnessConfig, options: &SuiteOptions) -> Result<Scenario, LaunchError> {
    let lifetime = config.timings.audio_secs;
    let ports = config.ports;

    let mut sources = Stage::sources(Duration::ZERO);
    for n in 1..=3 {
        sources = sources.case(CaseSpec::new(
            format!("test-audio-source{}", n),
            AudioSource::new(ports.audio).wave(2).build()?,
            lifetime,
        ));
    }

    let mut scenario = Scenario::new("audio")
        .with_server(delay(config, 3000))
        .stage(sources);

    if !options.external_ui {
        let mut sinks = Stage::sinks(delay(config, 2000));
        for slot in 1..=3u16 {
            sinks = sinks.case(CaseSpec::new(
                format!("test_audio_preview_sink{}", slot),
                presets::audio_preview_sink(
                    ports.preview(slot),
                    &format!("audio{}", slot),
                    &config.sinks.video,
                )?,
                lifetime,
            ));
        }
        scenario = scenario.stage(sinks);
    }

    Ok(scenario.artifact(Artifact::Exists(config.record_path.clone())))
}

/// Server and UI with three video and three audio sources
fn with_ui(name: &str, config: &HarnessConfig, lifetime: u64) -> Result<Scenario, LaunchError> {
    let mut sources = Stage::sources(Duration::ZERO);
    for n in 0..3 {
        sources = sources.case(CaseSpec::new(
            format!("test-video-source{}", n + 1),
            labelled_video(config, n, &format!("video{}", n + 1)).build()?,
            lifetime,
        ));
    }
    for n in 1..=3 {
        sources = sources.case(CaseSpec::new(
            format!("test-audio-source{}", n),
            AudioSource::new(config.ports.audio).build()?,
            lifetime,
        ));
    }

    Ok(Scenario::new(name)
        .with_server(delay(config, 3000))
        .with_ui(delay(config, 2000))
        .stage(sources))
}

pub fn ui_integrated(config: &HarnessConfig) -> Result<Scenario, LaunchError> {
    with_ui("ui-integrated", config, config.timings.ui_integrated_secs)
}

/// The UI scenario held long enough to switch sources by hand
pub fn switching(config: &HarnessConfig) -> Result<Scenario, LaunchError> {
    with_ui("switching", config, config.timings.switching_secs)
}

/// Two workers connecting and dropping sources in rounds while a
/// background audio source stays up
pub fn random_connections<R: Rng>(
    config: &HarnessConfig,
    rng: &mut R,
) -> Result<Scenario, LaunchError> {
    let t = &config.timings;
    let ports = config.ports;

    let mut first = Worker::new("worker1").background(
        CaseSpec::new(
            "test-audio-source0",
            AudioSource::new(ports.audio).wave(2).build()?,
            t.random_anchor_secs,
        ),
        delay(config, 2000),
    );
    let mut second = Worker::new("worker2").start_delay(delay(config, 1000));

    for round in 1..=t.random_rounds {
        first = first.round(vec![
            CaseSpec::new(
                format!("test-video-source1-{}", round),
                video_source(config)
                    .random_pattern(rng)
                    .label(format!("video1-{}", round))
                    .build()?,
                t.random_long_video_secs,
            ),
            CaseSpec::new(
                format!("test-audio-source1-{}", round),
                AudioSource::new(ports.audio).random_wave(rng).build()?,
                t.random_long_audio_secs,
            ),
        ]);
        second = second.round(vec![
            CaseSpec::new(
                format!("test-video-source2-{}", round),
                video_source(config)
                    .random_pattern(rng)
                    .label(format!("video2-{}", round))
                    .build()?,
                t.random_short_video_secs,
            ),
            CaseSpec::new(
                format!("test-audio-source2-{}", round),
                AudioSource::new(ports.audio).random_wave(rng).build()?,
                t.random_short_audio_secs,
            ),
        ]);
    }

    Ok(Scenario::new("random-connections")
        .with_server(delay(config, 2000))
        .with_ui(delay(config, 1000))
        .stage(Stage::sources(Duration::ZERO).worker(first).worker(second)))
}

/// Break a well-formed description in one of five ways
fn mutate(kind: u32, desc: &str) -> String {
    match kind {
        0 => format!("{} !", desc),
        1 => desc.replacen(" ! ", " ! ! ", 1),
        2 => format!("! {}", desc),
        3 => format!("{} text=\"unterminated", desc),
        _ => format!("port=3000 ! {}", desc),
    }
}

/// Random valid sources mixed with malformed descriptions. Malformed ones
/// must fail to launch without taking the server down.
pub fn fuzz<R: Rng>(config: &HarnessConfig, rng: &mut R) -> Result<Scenario, LaunchError> {
    let lifetime = config.timings.fuzz_secs;
    let ports = config.ports;
    let mut stage = Stage::sources(Duration::ZERO);

    for n in 1..=config.timings.fuzz_cases {
        let valid = if rng.gen_bool(0.5) {
            video_source(config).random_pattern(rng).build()?
        } else {
            AudioSource::new(ports.audio).random_wave(rng).build()?
        };
        let spec = if rng.gen_bool(0.5) {
            let broken = mutate(rng.gen_range(0..5), valid.as_str());
            CaseSpec::raw(format!("test-fuzz-malformed{}", n), broken, lifetime).tolerated()
        } else {
            CaseSpec::new(format!("test-fuzz-source{}", n), valid, lifetime)
        };
        stage = stage.case(spec);
    }

    Ok(Scenario::new("fuzz")
        .with_server(delay(config, 3000))
        .with_ui(delay(config, 2000))
        .stage(stage)
        .require_server_alive())
}

/// A teed source labelling two streams with the same running time
pub fn checking_timestamps(config: &HarnessConfig) -> Result<Scenario, LaunchError> {
    Ok(Scenario::new("checking-timestamps")
        .with_server(delay(config, 3000))
        .with_ui(delay(config, 2000))
        .stage(Stage::sources(Duration::ZERO).case(CaseSpec::new(
            "test-video-source",
            presets::timestamp_source(
                config.ports.video,
                config.video.width,
                config.video.height,
            )?,
            config.timings.timestamps_secs,
        ))))
}

/// Delete the recording left by the previous scenario
pub fn recording_result(name: &str, config: &HarnessConfig) -> Scenario {
    Scenario::new(name).artifact(Artifact::Cleanup(config.record_path.clone()))
}
