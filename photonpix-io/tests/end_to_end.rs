#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
use ndarray::Array2;
use photonpix_algorithms::DetectorConfig;
use photonpix_io::{
    ClusterCollector, ClusterFileReader, ClusterFileSink, RawFrameReader, RawFrameWriter,
};
use photonpix_pipeline::{Pipeline, PipelineConfig};
use tempfile::tempdir;
use tracing::Dispatch;

const SHAPE: (usize, usize) = (10, 12);

fn pedestal_frame(i: usize) -> Array2<u16> {
    Array2::from_elem(SHAPE, if i % 2 == 0 { 98 } else { 102 })
}

fn photon_frame(n: usize) -> Array2<u16> {
    let mut frame = Array2::from_elem(SHAPE, 100u16);
    frame[[2 + n % 6, 2 + n % 8]] = 350;
    frame
}

fn pipeline(n_workers: usize) -> Pipeline {
    let detector = DetectorConfig::new().with_n_samples(20);
    let config = PipelineConfig::new().with_n_workers(n_workers);
    Pipeline::new(SHAPE, &detector, config, Dispatch::default()).unwrap()
}

#[test]
fn test_raw_frames_to_cluster_file() {
    let dir = tempdir().unwrap();
    let raw_path = dir.path().join("frames.raw");
    let cluster_path = dir.path().join("clusters.bin");

    let mut writer = RawFrameWriter::create(&raw_path, SHAPE).unwrap();
    for i in 0..20 {
        writer.write_frame(pedestal_frame(i).view()).unwrap();
    }
    for n in 0..12 {
        writer.write_frame(photon_frame(n).view()).unwrap();
    }
    writer.flush().unwrap();

    let frames = RawFrameReader::open(&raw_path, SHAPE).unwrap();
    assert_eq!(frames.n_frames(), 32);

    let mut pipeline = pipeline(3);
    let sink = ClusterFileSink::spawn(pipeline.sink(), &cluster_path, Dispatch::default()).unwrap();
    for (index, frame) in frames.frames().enumerate() {
        let frame = frame.unwrap();
        if index < 20 {
            pipeline.submit_pedestal(frame.view()).unwrap();
        } else {
            pipeline
                .submit_data(frame.view(), (index - 20) as u64)
                .unwrap();
        }
    }
    pipeline.stop().unwrap();

    let summary = sink.join().unwrap();
    assert_eq!(summary.frames, 12);
    assert_eq!(summary.clusters, 12);

    let mut reader = ClusterFileReader::<i32>::open(&cluster_path, 3, 3).unwrap();
    let mut seen: Vec<u64> = Vec::new();
    for buffer in reader.by_ref() {
        let buffer = buffer.unwrap();
        assert_eq!(buffer.len(), 1);
        let record = buffer.get(0).unwrap();
        let n = buffer.frame_number() as usize;
        assert_eq!(record.x(), (2 + n % 8) as i16);
        assert_eq!(record.y(), (2 + n % 6) as i16);
        assert_eq!(record.value(4), 250);
        seen.push(buffer.frame_number());
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..12).collect::<Vec<_>>());
    assert!(reader.is_at_end());
}

#[test]
fn test_collector_gathers_one_buffer_per_frame() {
    let mut pipeline = pipeline(2);
    let collector = ClusterCollector::spawn(pipeline.sink(), Dispatch::default()).unwrap();
    for i in 0..20 {
        pipeline.submit_pedestal(pedestal_frame(i).view()).unwrap();
    }
    for n in 0..6 {
        pipeline.submit_data(photon_frame(n).view(), n as u64).unwrap();
    }
    pipeline.stop().unwrap();

    let buffers = collector.join().unwrap();
    assert_eq!(buffers.len(), 6);
    let total: usize = buffers.iter().map(|b| b.len()).sum();
    assert_eq!(total, 6);
}
