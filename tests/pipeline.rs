use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use vpuflow::codec::{CodecData, CodecPolicy};
use vpuflow::engine::bitstream;
use vpuflow::engine::sim::{SimOptions, SimulatedFactory};
use vpuflow::engine::{CropRect, OutputFormat};
use vpuflow::{
    Codec, Config, Picture, PictureFormat, Pipeline, PipelineError, PlaybackClock, Release,
    StreamHints,
};

struct FixedClock(i64);

impl PlaybackClock for FixedClock {
    fn now(&self) -> Option<i64> {
        Some(self.0)
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn take_pictures(pipeline: &Pipeline, count: usize) -> Vec<Picture> {
    let mut pictures = Vec::new();
    let done = wait_until(|| {
        if let Some(picture) = pipeline.acquire_picture() {
            pictures.push(picture);
        }
        pictures.len() >= count
    });
    assert!(done, "only {} of {} pictures arrived", pictures.len(), count);
    pictures
}

fn open(factory: &SimulatedFactory, config: &Config) -> Pipeline {
    let hints = StreamHints::new(Codec::H264, 1280, 720);
    match Pipeline::open(factory, &hints, config, None) {
        Ok(pipeline) => pipeline,
        Err(e) => panic!("pipeline failed to open: {e}"),
    }
}

fn open_err(factory: &SimulatedFactory, hints: &StreamHints, config: &Config) -> PipelineError {
    match Pipeline::open(factory, hints, config, None) {
        Ok(_) => panic!("pipeline opened unexpectedly"),
        Err(e) => e,
    }
}

fn submit(pipeline: &Pipeline, timestamp: i64) {
    let data = format!("frame-{timestamp}");
    pipeline
        .submit(data.as_bytes(), None, Some(timestamp))
        .unwrap();
}

#[test]
fn pictures_arrive_in_submission_order_without_failed_frames() {
    let factory = SimulatedFactory::new(SimOptions {
        error_timestamps: vec![30],
        ..Default::default()
    });
    let pipeline = open(&factory, &Config::default());

    for ts in [10, 20, 30, 40, 50] {
        submit(&pipeline, ts);
    }
    let pts: Vec<_> = take_pictures(&pipeline, 4)
        .into_iter()
        .map(|picture| {
            let pts = picture.pts;
            assert_eq!(picture.format, PictureFormat::HardwareBuffer);
            assert!(pipeline.clear_picture(picture).is_freed());
            pts
        })
        .collect();
    assert_eq!(pts, vec![10, 20, 40, 50]);

    let stats = pipeline.stats();
    assert_eq!(stats.frames_submitted, 5);
    assert_eq!(stats.frames_decoded, 4);
    assert_eq!(stats.frames_dropped, 1);
    assert_eq!(stats.frames_delivered, 4);
}

#[test]
fn negative_timestamp_is_dropped_silently() {
    let factory = SimulatedFactory::new(SimOptions::default());
    let pipeline = open(&factory, &Config::default());

    let status = pipeline.submit(b"frame", None, Some(-1)).unwrap();
    assert!(status.ready_for_input);
    assert!(!status.picture_ready);
    assert_eq!(status.bits(), 0x02);
    assert_eq!(pipeline.queued_inputs(), 0);
    assert_eq!(pipeline.sequence(), 0);
    assert_eq!(pipeline.stats().frames_rejected, 1);

    thread::sleep(Duration::from_millis(20));
    assert!(pipeline.acquire_picture().is_none());
}

#[test]
fn full_output_queue_holds_the_worker_back() {
    let factory = SimulatedFactory::new(SimOptions::default());
    let mut config = Config::default();
    config.pipeline.output_capacity = 2;
    let pipeline = open(&factory, &config);
    assert_eq!(pipeline.output_capacity(), 2);

    for ts in [10, 20, 30] {
        submit(&pipeline, ts);
    }
    assert!(wait_until(|| pipeline.pending_pictures() == 2 && pipeline.queued_inputs() == 0));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(pipeline.pending_pictures(), 2);

    let status = pipeline.submit(&[], None, None).unwrap();
    assert!(status.picture_ready);

    let first = pipeline.acquire_picture().unwrap();
    assert_eq!(first.pts, 10);
    assert!(wait_until(|| pipeline.pending_pictures() == 2));

    let rest: Vec<_> = take_pictures(&pipeline, 2).iter().map(|p| p.pts).collect();
    assert_eq!(rest, vec![20, 30]);
}

#[test]
fn reset_discards_queued_input_and_seeks_to_clock() {
    let factory = SimulatedFactory::new(SimOptions::default());
    let probe = factory.probe();
    let mut config = Config::default();
    config.pipeline.output_capacity = 1;
    let hints = StreamHints::new(Codec::H264, 1280, 720);
    let clock: Arc<dyn PlaybackClock> = Arc::new(FixedClock(4242));
    let pipeline = Pipeline::open(&factory, &hints, &config, Some(clock)).unwrap();

    for ts in [10, 20, 30, 40] {
        submit(&pipeline, ts);
    }
    // 10 sits in the output queue, the worker is stuck publishing 20
    assert!(wait_until(|| pipeline.pending_pictures() == 1 && pipeline.queued_inputs() == 2));
    assert_eq!(pipeline.sequence(), 4);

    pipeline.reset();
    assert_eq!(pipeline.queued_inputs(), 0);
    assert_eq!(pipeline.sequence(), 0);

    let before: Vec<_> = take_pictures(&pipeline, 2).iter().map(|p| p.pts).collect();
    assert_eq!(before, vec![10, 20]);

    submit(&pipeline, 50);
    assert_eq!(pipeline.sequence(), 1);
    let after = take_pictures(&pipeline, 1);
    assert_eq!(after[0].pts, 50);

    assert_eq!(probe.inputs().len(), 3);
    assert_eq!(probe.seeks(), vec![None, None, Some(4242)]);
}

#[test]
fn buffer_locks_are_counted() {
    let factory = SimulatedFactory::new(SimOptions::default());
    let memory = factory.memory();
    let pipeline = open(&factory, &Config::default());

    submit(&pipeline, 10);
    let picture = take_pictures(&pipeline, 1).remove(0);
    let buffer = picture.buffer().cloned().unwrap();
    assert_eq!(buffer.frame_size(), (1280, 720));
    assert_eq!(memory.refs(&buffer.descriptor().mem), 1);

    assert!(pipeline.lock_buffer(&buffer));
    assert_eq!(pipeline.busy_buffers(), 1);
    assert_eq!(pipeline.release_buffer(&buffer), Release::StillLocked(1));
    assert_eq!(pipeline.clear_picture(picture), Release::Freed);
    assert_eq!(pipeline.busy_buffers(), 0);

    // A second release is reported, never freed twice
    let extra = pipeline.release_buffer(&buffer);
    assert_eq!(extra, Release::NotTracked);
    assert!(extra.is_freed());
    assert_eq!(memory.live(), 0);
    assert_eq!(memory.double_frees(), 0);
}

#[test]
fn dispose_mid_decode_releases_everything() {
    let factory = SimulatedFactory::new(SimOptions {
        decode_delay: Duration::from_millis(20),
        ..Default::default()
    });
    let memory = factory.memory();
    let probe = factory.probe();
    let mut config = Config::default();
    config.pipeline.dispose_grace_ms = 2000;
    let pipeline = open(&factory, &config);

    for ts in [10, 20, 30, 40, 50, 60] {
        submit(&pipeline, ts);
    }
    let held = take_pictures(&pipeline, 1).remove(0);
    assert_eq!(pipeline.busy_buffers(), 1);

    pipeline.dispose();
    assert!(probe.stopped());
    assert_eq!(pipeline.queued_inputs(), 0);
    assert_eq!(pipeline.pending_pictures(), 0);
    assert_eq!(pipeline.busy_buffers(), 0);
    assert_eq!(memory.live(), 0);
    assert_eq!(probe.raw_outstanding(), 0);

    // The held picture's memory went with the pipeline
    let buffer = held.buffer().cloned().unwrap();
    assert!(buffer.is_retired());
    assert!(!pipeline.lock_buffer(&buffer));
    assert_eq!(pipeline.clear_picture(held), Release::NotTracked);
    assert_eq!(memory.double_frees(), 0);
    assert!(pipeline.acquire_picture().is_none());

    assert!(matches!(
        pipeline.submit(b"late", None, Some(70)),
        Err(PipelineError::Disposed)
    ));
    pipeline.dispose();
}

#[test]
fn dispose_outlasting_the_grace_period_releases_everything() {
    // The worker's stop check is deterministic, but repeat to cover
    // whichever point of the decode the stop lands on
    for _ in 0..5 {
        let factory = SimulatedFactory::new(SimOptions {
            decode_delay: Duration::from_millis(150),
            ..Default::default()
        });
        let memory = factory.memory();
        let probe = factory.probe();
        let config = Config::default();
        assert!(config.pipeline.dispose_grace_ms < 150);
        let pipeline = open(&factory, &config);

        submit(&pipeline, 10);
        assert!(wait_until(|| probe.inputs().len() == 1));
        pipeline.dispose();
        assert!(pipeline.acquire_picture().is_none());

        // The worker closes the engine itself once its decode returns
        assert!(wait_until(|| probe.stopped()));
        assert_eq!(pipeline.pending_pictures(), 0);
        assert_eq!(pipeline.queued_inputs(), 0);
        assert_eq!(pipeline.busy_buffers(), 0);
        assert_eq!(memory.live(), 0);
        assert_eq!(probe.raw_outstanding(), 0);
        assert!(pipeline.acquire_picture().is_none());
    }
}

#[test]
fn cleared_buffer_cannot_be_locked_again() {
    let factory = SimulatedFactory::new(SimOptions::default());
    let memory = factory.memory();
    let pipeline = open(&factory, &Config::default());

    submit(&pipeline, 10);
    let picture = take_pictures(&pipeline, 1).remove(0);
    let buffer = picture.buffer().cloned().unwrap();
    assert_eq!(pipeline.clear_picture(picture), Release::Freed);

    assert!(!pipeline.lock_buffer(&buffer));
    assert_eq!(pipeline.busy_buffers(), 0);
    assert_eq!(pipeline.release_buffer(&buffer), Release::NotTracked);
    assert_eq!(memory.live(), 0);
    assert_eq!(memory.double_frees(), 0);
}

#[test]
fn format_change_updates_geometry() {
    let format = OutputFormat {
        width: 1920,
        height: 1088,
        crop: Some(CropRect {
            left: 0,
            top: 0,
            right: 1919,
            bottom: 1079,
        }),
        stride: Some(2048),
        slice_height: None,
        color_format: 0x15,
    };
    let factory = SimulatedFactory::new(SimOptions {
        format_changes: vec![(20, format)],
        ..Default::default()
    });
    let pipeline = open(&factory, &Config::default());
    assert_eq!(pipeline.geometry().width, 1280);

    submit(&pipeline, 10);
    submit(&pipeline, 20);
    let pictures = take_pictures(&pipeline, 2);
    assert_eq!((pictures[0].pts, pictures[0].width), (10, 1280));
    assert_eq!(
        (pictures[1].pts, pictures[1].width, pictures[1].height),
        (20, 1920, 1080)
    );

    let geometry = pipeline.geometry();
    assert_eq!(geometry.stride, 2048);
    assert_eq!(geometry.slice_height, 1080);
    assert_eq!(pipeline.stats().format_changes, 1);
    assert_eq!(pipeline.stats().frames_dropped, 0);
}

#[test]
fn software_output_uses_the_single_slot() {
    let factory = SimulatedFactory::new(SimOptions {
        software_timestamps: vec![20],
        ..Default::default()
    });
    let probe = factory.probe();
    let mut config = Config::default();
    config.pipeline.software_output = true;
    let pipeline = open(&factory, &config);

    for ts in [10, 20, 30] {
        submit(&pipeline, ts);
    }
    let pictures = take_pictures(&pipeline, 3);
    let formats: Vec<_> = pictures.iter().map(|p| (p.pts, p.format)).collect();
    assert_eq!(
        formats,
        vec![
            (10, PictureFormat::HardwareBuffer),
            (20, PictureFormat::Software),
            (30, PictureFormat::HardwareBuffer),
        ]
    );
    assert_eq!(
        pictures[1].data(),
        Some(&Bytes::from_static(b"frame-20"))
    );
    assert!(pictures[1].buffer().is_none());

    for picture in pictures {
        assert_eq!(pipeline.clear_picture(picture), Release::Freed);
    }
    assert_eq!(probe.raw_outstanding(), 0);
}

#[test]
fn software_output_is_dropped_unless_enabled() {
    let factory = SimulatedFactory::new(SimOptions {
        software_timestamps: vec![20],
        ..Default::default()
    });
    let pipeline = open(&factory, &Config::default());

    for ts in [10, 20, 30] {
        submit(&pipeline, ts);
    }
    let pts: Vec<_> = take_pictures(&pipeline, 2).iter().map(|p| p.pts).collect();
    assert_eq!(pts, vec![10, 30]);
    assert_eq!(pipeline.stats().frames_dropped, 1);
}

#[test]
fn blacklisted_component_is_refused() {
    let factory = SimulatedFactory::new(SimOptions {
        component: Some("OMX.google.h264.decoder".into()),
        ..Default::default()
    });
    let probe = factory.probe();
    let hints = StreamHints::new(Codec::H264, 1280, 720);

    let err = open_err(&factory, &hints, &Config::default());
    assert!(matches!(err, PipelineError::Blacklisted { .. }));
    assert!(probe.stopped());
}

#[test]
fn session_parameters_are_validated() {
    let factory = SimulatedFactory::new(SimOptions::default());
    let mut config = Config::default();

    let err = open_err(&factory, &StreamHints::new(Codec::H264, 0, 720), &config);
    assert!(matches!(err, PipelineError::InvalidHints { width: 0, .. }));

    config.codecs.avc = CodecPolicy::SdOnly;
    let err = open_err(&factory, &StreamHints::new(Codec::H264, 1280, 720), &config);
    assert!(matches!(err, PipelineError::CodecDisabled { codec: Codec::H264, width: 1280 }));

    let err = open_err(&factory, &StreamHints::new(Codec::Hevc, 8192, 4320), &config);
    assert!(matches!(err, PipelineError::Engine(_)));
}

#[test]
fn mpeg2_input_is_framed() {
    let factory = SimulatedFactory::new(SimOptions::default());
    let probe = factory.probe();
    let hints = StreamHints::new(Codec::Mpeg2, 720, 576);
    let pipeline = Pipeline::open(&factory, &hints, &Config::default(), None).unwrap();
    assert_eq!(probe.last_request().unwrap().mimetype, "video/mpeg2");

    pipeline.submit(b"abc", None, Some(40_000)).unwrap();
    take_pictures(&pipeline, 1);

    let input = probe.inputs().remove(0);
    assert_eq!(input.len(), bitstream::HEADER_LEN + 3);
    let mut header = input.clone();
    assert_eq!(header.get_u32_le(), bitstream::START_CODE);
    assert_eq!(header.get_u32_le(), 3);
    assert_eq!(header.get_u32_le(), 40);
    assert_eq!(&input[bitstream::HEADER_LEN..], b"abc");
}

#[test]
fn vc1_sequence_header_is_the_first_input() {
    let factory = SimulatedFactory::new(SimOptions::default());
    let probe = factory.probe();
    let mut hints = StreamHints::new(Codec::Vc1, 1280, 720);
    hints.extradata = Bytes::from_static(&[0x0f, 0xcb, 0x86, 0x0a]);
    let pipeline = Pipeline::open(&factory, &hints, &Config::default(), None).unwrap();

    assert_eq!(
        probe.last_request().unwrap().codec_data,
        CodecData::Vc1ExtraSize(4)
    );
    submit(&pipeline, 10);
    let pts: Vec<_> = take_pictures(&pipeline, 2).iter().map(|p| p.pts).collect();
    assert_eq!(pts, vec![0, 10]);
    assert_eq!(probe.inputs()[0], hints.extradata);
}

#[test]
fn oversized_input_is_refused() {
    let factory = SimulatedFactory::new(SimOptions::default());
    let mut config = Config::default();
    config.pipeline.input_buffer_size = 16;
    let pipeline = open(&factory, &config);

    let err = pipeline.submit(&[0u8; 32], None, Some(10)).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Allocation {
            requested: 32,
            limit: 16
        }
    ));
    assert_eq!(pipeline.queued_inputs(), 0);
}

#[test]
fn drop_mode_marks_pictures() {
    let factory = SimulatedFactory::new(SimOptions::default());
    let pipeline = open(&factory, &Config::default());

    pipeline.set_drop_mode(true);
    submit(&pipeline, 10);
    assert!(take_pictures(&pipeline, 1)[0].dropped);

    pipeline.set_drop_mode(false);
    submit(&pipeline, 20);
    assert!(!take_pictures(&pipeline, 1)[0].dropped);
}

#[test]
fn aspect_ratio_sets_display_size() {
    let factory = SimulatedFactory::new(SimOptions::default());
    let mut hints = StreamHints::new(Codec::H264, 720, 480);
    hints.aspect = 4.0 / 3.0;
    let pipeline = Pipeline::open(&factory, &hints, &Config::default(), None).unwrap();

    submit(&pipeline, 10);
    let picture = take_pictures(&pipeline, 1).remove(0);
    assert_eq!((picture.width, picture.height), (720, 480));
    assert_eq!((picture.display_width, picture.display_height), (640, 480));
}
