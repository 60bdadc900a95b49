//! End-to-end encoder scenarios with default and recording primitives

use std::sync::{Arc, Mutex};

use ndarray::{s, Array3, Axis};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::SeedableRng;
use separate_encoder::{
    Attention, AttentionMask, CrossCorrelation, EncoderConfig, FullAttention, HierarchicalEncoder, Result,
    TradeOff,
};

/// Records every fusion call and returns the reference unchanged
#[derive(Debug)]
struct RecordingCorrelation {
    layer: usize,
    calls: Arc<Mutex<Vec<(usize, Array3<f64>, Array3<f64>)>>>,
}

impl CrossCorrelation for RecordingCorrelation {
    fn fuse(&self, reference: &Array3<f64>, current: &Array3<f64>) -> Result<Array3<f64>> {
        self.calls
            .lock()
            .unwrap()
            .push((self.layer, reference.clone(), current.clone()));
        Ok(reference.clone())
    }
}

type Calls = Arc<Mutex<Vec<(usize, Array3<f64>, Array3<f64>)>>>;

fn recording_encoder(config: EncoderConfig) -> (HierarchicalEncoder, Calls) {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let mut rng = StdRng::seed_from_u64(99);
    let (d_model, n_heads) = (config.d_model, config.n_heads);

    let recorder = calls.clone();
    let encoder = HierarchicalEncoder::with_components(
        config,
        |_, _| -> Result<Box<dyn Attention>> {
            Ok(Box::new(FullAttention::new(d_model, n_heads, 0.0, false, false, &mut rng)?))
        },
        |spec| -> Result<Box<dyn CrossCorrelation>> {
            Ok(Box::new(RecordingCorrelation {
                layer: spec.index,
                calls: recorder.clone(),
            }))
        },
    )
    .unwrap();

    (encoder, calls)
}

fn tiny_config() -> EncoderConfig {
    EncoderConfig {
        d_model: 4,
        n_heads: 2,
        seed: Some(5),
        ..Default::default()
    }
}

fn single_layer_config() -> EncoderConfig {
    EncoderConfig {
        n_layers: 1,
        steps: vec![24],
        separate_factors: vec![3],
        ..tiny_config()
    }
}

fn broadcast_mean(block: &Array3<f64>) -> Array3<f64> {
    let mean = block.mean_axis(Axis(1)).unwrap().insert_axis(Axis(1));
    mean.broadcast(block.dim()).unwrap().to_owned()
}

fn assert_close(a: &Array3<f64>, b: &Array3<f64>) {
    assert_eq!(a.dim(), b.dim());
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() < 1e-10, "{} != {}", x, y);
    }
}

#[test]
fn test_default_configuration_end_to_end() {
    let config = EncoderConfig {
        seed: Some(2024),
        ..Default::default()
    };
    let encoder = HierarchicalEncoder::new(config).unwrap();
    let x = Array3::random((2, 192, 512), Uniform::new(-1.0, 1.0));

    let (output, layer_outputs) = encoder.forward(&x, None).unwrap().into_parts();

    assert_eq!(output.dim(), (2, 32, 512));
    assert_eq!(layer_outputs.len(), 2);
    assert_eq!(layer_outputs[0].dim(), (2, 64, 512));
    assert_eq!(layer_outputs[1].dim(), (2, 32, 512));
    assert!(output.iter().all(|v| v.is_finite()));
}

#[test]
fn test_default_schedule_with_layer_masks() {
    let (encoder, calls) = recording_encoder(tiny_config());
    let x = Array3::random((1, 48, 4), Uniform::new(-1.0, 1.0));

    let masks = vec![AttentionMask::causal(24), AttentionMask::causal(8)];
    let (output, layer_outputs) = encoder.forward(&x, Some(masks.as_slice())).unwrap().into_parts();

    assert_eq!(output.dim(), (1, 8, 4));
    assert_eq!(layer_outputs[0].dim(), (1, 16, 4));
    assert_eq!(calls.lock().unwrap().len(), 4);

    // a single mask cannot serve both block lengths
    let err = encoder.forward(&x, Some(&masks[..1])).unwrap_err();
    assert!(err.is_shape_error());
}

#[test]
fn test_trailing_steps_are_dropped() {
    let (encoder, _) = recording_encoder(tiny_config());
    let x = Array3::random((1, 50, 4), Uniform::new(-1.0, 1.0));
    let trimmed = x.slice(s![.., 0..48, ..]).to_owned();

    let plan = encoder.plan(50).unwrap();
    assert_eq!(plan[0].block_count, 2);
    assert_eq!(plan[0].dropped, 2);

    let full = encoder.forward(&x, None).unwrap();
    let cut = encoder.forward(&trimmed, None).unwrap();

    assert_eq!(full.layer_outputs[0].dim(), (1, 16, 4));
    assert_eq!(full.output.dim(), (1, 8, 4));
    assert_eq!(full.output, cut.output);
    assert_eq!(full.layer_outputs[0], cut.layer_outputs[0]);
}

#[test]
fn test_first_block_is_not_fused() {
    let (encoder, calls) = recording_encoder(tiny_config());

    // one block in each layer: 24 -> 8 -> 4
    let x = Array3::random((1, 24, 4), Uniform::new(-1.0, 1.0));
    let out = encoder.forward(&x, None).unwrap();
    assert_eq!(out.output.dim(), (1, 4, 4));
    assert!(calls.lock().unwrap().is_empty());

    // two blocks in each layer: one fusion per path and layer
    let x = Array3::random((1, 48, 4), Uniform::new(-1.0, 1.0));
    encoder.forward(&x, None).unwrap();
    let layers: Vec<usize> = calls.lock().unwrap().iter().map(|c| c.0).collect();
    assert_eq!(layers, vec![0, 0, 1, 1]);
}

#[test]
fn test_second_block_fusion_is_exact() {
    let mut encoder = HierarchicalEncoder::new(single_layer_config()).unwrap();
    encoder.set_trade_off(0, TradeOff::new(0.5, 0.25)).unwrap();

    let x = Array3::random((1, 48, 4), Uniform::new(-1.0, 1.0));
    let (output, layer_outputs) = encoder.forward(&x, None).unwrap().into_parts();

    let mean_layer = encoder.mean_layer(0).unwrap();
    let deviation_layer = encoder.deviation_layer(0).unwrap();
    let correlation = encoder.correlation(0).unwrap();

    let block0 = x.slice(s![.., 0..24, ..]).to_owned();
    let block1 = x.slice(s![.., 24..48, ..]).to_owned();

    // block 0: raw block, no fusion
    let (prev, _) = mean_layer.forward(&block0, None).unwrap();
    let (prev_div, _) = deviation_layer.forward(&(&block0 - &broadcast_mean(&block0)), None).unwrap();
    assert_close(&output.slice(s![.., 0..8, ..]).to_owned(), &prev);
    assert_close(&layer_outputs[0].slice(s![.., 0..8, ..]).to_owned(), &prev_div);

    // block 1: broadcast mean, fused with block 0
    let mean1 = broadcast_mean(&block1);
    let (base, _) = mean_layer.forward(&mean1, None).unwrap();
    let (base_div, _) = deviation_layer.forward(&(&block1 - &mean1), None).unwrap();
    let expected = &base + &(correlation.fuse(&prev, &base).unwrap() * 0.5);
    let expected_div = &base_div + &(correlation.fuse(&prev_div, &base_div).unwrap() * 0.25);

    assert_close(&output.slice(s![.., 8..16, ..]).to_owned(), &expected);
    assert_close(&layer_outputs[0].slice(s![.., 8..16, ..]).to_owned(), &expected_div);
}

#[test]
fn test_zero_trade_off_disables_fusion() {
    let (encoder, calls) = recording_encoder(single_layer_config());
    let x = Array3::random((1, 48, 4), Uniform::new(-1.0, 1.0));

    let output = encoder.forward(&x, None).unwrap().output;

    let block1 = x.slice(s![.., 24..48, ..]).to_owned();
    let (base, _) = encoder.mean_layer(0).unwrap().forward(&broadcast_mean(&block1), None).unwrap();
    assert_close(&output.slice(s![.., 8..16, ..]).to_owned(), &base);
    // fusion is still evaluated, only weighted by zero
    assert_eq!(calls.lock().unwrap().len(), 2);
}

#[test]
fn test_fusion_reference_is_previous_pre_fusion_output() {
    let (mut encoder, calls) = recording_encoder(single_layer_config());
    encoder.set_trade_off(0, TradeOff::splat(1.0)).unwrap();

    let x = Array3::random((1, 72, 4), Uniform::new(-1.0, 1.0));
    encoder.forward(&x, None).unwrap();

    let block1 = x.slice(s![.., 24..48, ..]).to_owned();
    let (base1, _) = encoder.mean_layer(0).unwrap().forward(&broadcast_mean(&block1), None).unwrap();

    let calls = calls.lock().unwrap();
    // mean and deviation fusion for blocks 1 and 2
    assert_eq!(calls.len(), 4);
    // block 2, mean path: reference is block 1 before its own fusion
    assert_close(&calls[2].1, &base1);
}

#[test]
fn test_per_layer_trade_offs_are_independent() {
    let config = EncoderConfig {
        trade_off_sharing: separate_encoder::TradeOffSharing::PerLayer,
        ..tiny_config()
    };
    let (mut encoder, _) = recording_encoder(config);
    let x = Array3::random((1, 48, 4), Uniform::new(-1.0, 1.0));
    let baseline = encoder.forward(&x, None).unwrap();

    // only layer 1 fuses differently; layer 0 deviation output is unchanged
    encoder.set_trade_off(1, TradeOff::splat(1.0)).unwrap();
    let changed = encoder.forward(&x, None).unwrap();

    assert_eq!(baseline.layer_outputs[0], changed.layer_outputs[0]);
    assert_ne!(baseline.layer_outputs[1], changed.layer_outputs[1]);
}

#[test]
fn test_too_short_input_fails_before_encoding() {
    let (encoder, calls) = recording_encoder(tiny_config());
    let x = Array3::random((1, 20, 4), Uniform::new(-1.0, 1.0));

    let err = encoder.forward(&x, None).unwrap_err();
    assert!(err.is_shape_error());
    assert!(calls.lock().unwrap().is_empty());
}
