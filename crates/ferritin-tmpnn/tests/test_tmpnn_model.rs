use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use ferritin_tmpnn::tmpnn::utilities::{NUM_AMINO_ACIDS, PAD_TOKEN};
use ferritin_tmpnn::{
    ideal_helix, ChainRecord, DegenerateFramePolicy, ExecutionContext, IpaConfig, ProteinBatch,
    SampleConfig, TMPNNConfig, TMPNNLoss, TMPNN,
};

fn small_config() -> TMPNNConfig {
    TMPNNConfig {
        node_features: 16,
        edge_features: 16,
        hidden_dim: 16,
        num_encoder_layers: 2,
        num_decoder_layers: 2,
        num_ipa_layers: 1,
        k_neighbors: 5,
        num_heads: 4,
        ipa: IpaConfig {
            c_hidden: 4,
            num_heads: 2,
            num_qk_points: 2,
            num_v_points: 2,
            ..IpaConfig::default()
        },
        ..TMPNNConfig::tmpnn()
    }
}

fn load(config: &TMPNNConfig) -> Result<(VarMap, TMPNN)> {
    let ctx = ExecutionContext::cpu();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, ctx.dtype, &ctx.device);
    let model = TMPNN::load(vb, config, &ctx)?;
    Ok((varmap, model))
}

/// Helix with a small deterministic jitter so no two neighbor distances tie.
fn jittered_chain(len: usize, seed: usize) -> ChainRecord {
    let coords = ideal_helix(len)
        .into_iter()
        .enumerate()
        .map(|(i, mut residue)| {
            for (a, atom) in residue.iter_mut().enumerate() {
                for (c, value) in atom.iter_mut().enumerate() {
                    let h = (i * 7919 + a * 104729 + c * 1299709 + seed * 15485863) % 1000;
                    *value += 0.3 * (h as f32 / 1000.0 - 0.5);
                }
            }
            residue
        })
        .collect();
    let sequence: String = (0..len)
        .map(|i| "ACDEFGHIKLMNPQRSTVWY".as_bytes()[(i * 7 + seed) % 20] as char)
        .collect();
    ChainRecord {
        coords,
        sequence,
        labels: Some((0..len).map(|i| ((i / 3) % 5) as u32).collect()),
    }
}

fn two_chain_batch(device: &Device) -> Result<ProteinBatch> {
    Ok(ProteinBatch::collate(
        &[jittered_chain(10, 1), jittered_chain(7, 2)],
        device,
    )?)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

#[test]
fn test_forward_shapes_and_normalisation() -> Result<()> {
    let device = Device::Cpu;
    let config = small_config();
    let (_varmap, model) = load(&config)?;
    let batch = two_chain_batch(&device)?;

    let output = model.forward(&batch, false)?;
    assert_eq!(output.log_probs.dims(), &[2, 10, 22]);
    assert_eq!(output.label_logits.dims(), &[2, 10, 5]);

    let sums = output.log_probs.exp()?.sum(D::Minus1)?.to_vec2::<f32>()?;
    for row in sums {
        for total in row {
            assert!((total - 1.0).abs() < 1e-4, "{total}");
        }
    }

    let encoded = model.encode(&batch, false)?;
    assert_eq!(encoded.h_e.dims(), &[2, 10, 5, 16]);
    let e_idx = encoded.e_idx.to_vec3::<u32>()?;
    for row in e_idx[1].iter().take(7) {
        assert_eq!(row.len(), 5);
        // every neighbor of a valid residue in the short chain is itself valid
        assert!(row.iter().all(|&j| j < 7));
    }
    Ok(())
}

#[test]
fn test_sample_shapes() -> Result<()> {
    let device = Device::Cpu;
    let (_varmap, model) = load(&small_config())?;
    let batch = two_chain_batch(&device)?;

    let sampled = model.sample(
        &batch,
        &SampleConfig {
            temperature: 1.0,
            seed: Some(42),
        },
    )?;
    assert_eq!(sampled.s.dims(), &[2, 10]);
    assert_eq!(sampled.log_probs.dims(), &[2, 10, 22]);
    assert_eq!(sampled.label_logits.dims(), &[2, 10, 5]);

    let s = sampled.s.to_vec2::<u32>()?;
    assert!(s.iter().flatten().all(|&token| token < 22));
    assert!(s[0].iter().all(|&token| (token as usize) < NUM_AMINO_ACIDS));
    assert!(s[1][..7].iter().all(|&token| (token as usize) < NUM_AMINO_ACIDS));
    assert_eq!(s[1][7..], [PAD_TOKEN; 3]);

    // the seed fixes the draw
    let again = model.sample(
        &batch,
        &SampleConfig {
            temperature: 1.0,
            seed: Some(42),
        },
    )?;
    assert_eq!(again.s.to_vec2::<u32>()?, s);

    let bad = SampleConfig {
        temperature: -1.0,
        seed: None,
    };
    assert!(model.sample(&batch, &bad).is_err());
    Ok(())
}

#[test]
fn test_sequential_sampling_matches_parallel_scoring() -> Result<()> {
    let device = Device::Cpu;
    let (_varmap, model) = load(&small_config())?;
    let batch = two_chain_batch(&device)?;

    let sampled = model.sample(
        &batch,
        &SampleConfig {
            temperature: 0.5,
            seed: Some(7),
        },
    )?;
    // score the sampled sequence in one parallel pass
    let forced = ProteinBatch::from_lengths(batch.x.clone(), sampled.s.clone(), batch.lengths.clone())?;
    let output = model.forward(&forced, false)?;

    let mask = batch.mask.unsqueeze(D::Minus1)?;
    let diff = max_abs_diff(
        &output.log_probs.broadcast_mul(&mask)?,
        &sampled.log_probs.broadcast_mul(&mask)?,
    )?;
    assert!(diff < 1e-3, "diff {diff}");

    let diff = max_abs_diff(
        &output.label_logits.broadcast_mul(&mask)?,
        &sampled.label_logits.broadcast_mul(&mask)?,
    )?;
    assert!(diff < 1e-3, "diff {diff}");
    Ok(())
}

#[test]
fn test_parallel_scoring_is_causal() -> Result<()> {
    let device = Device::Cpu;
    let (_varmap, model) = load(&small_config())?;
    let batch = two_chain_batch(&device)?;

    // replace every residue from position 6 on
    let mut s = batch.s.to_vec2::<u32>()?;
    for row in s.iter_mut() {
        for (i, token) in row.iter_mut().enumerate() {
            if i >= 6 && *token != PAD_TOKEN {
                *token = (*token + 5) % 20;
            }
        }
    }
    let s = Tensor::new(s, &device)?;
    let changed = ProteinBatch::from_lengths(batch.x.clone(), s, batch.lengths.clone())?;

    let a = model.forward(&batch, false)?.log_probs.narrow(1, 0, 7)?;
    let c = model.forward(&changed, false)?.log_probs.narrow(1, 0, 7)?;
    let diff = max_abs_diff(&a, &c)?;
    assert!(diff < 1e-5, "diff {diff}");
    Ok(())
}

#[test]
fn test_loss_ignores_padded_content() -> Result<()> {
    let device = Device::Cpu;
    let (_varmap, model) = load(&small_config())?;
    let batch = two_chain_batch(&device)?;
    let labels = batch.labels.clone().expect("collated with labels");
    let criterion = TMPNNLoss::default();

    let output = model.forward(&batch, false)?;
    let loss = criterion.compute(
        model.crf(),
        &batch.s,
        &output.log_probs,
        &labels,
        &output.label_logits,
        &output.mask,
    )?;

    // garbage in the padded tail of the second chain
    let keep = batch.mask.gt(0.5)?.reshape((2, 10, 1, 1))?.broadcast_as(batch.x.shape())?;
    let nan = Tensor::full(f32::NAN, batch.x.shape(), &device)?;
    let x = keep.where_cond(&batch.x, &nan)?;
    let mut s = batch.s.to_vec2::<u32>()?;
    let mut l = labels.to_vec2::<u32>()?;
    for i in 7..10 {
        s[1][i] = 3;
        l[1][i] = 4;
    }
    let dirty = ProteinBatch::new(x, Tensor::new(s, &device)?, batch.mask.clone(), batch.lengths.clone())?
        .with_labels(Tensor::new(l, &device)?)?;
    let dirty_labels = dirty.labels.clone().expect("labels set above");

    let dirty_output = model.forward(&dirty, false)?;
    let dirty_loss = criterion.compute(
        model.crf(),
        &dirty.s,
        &dirty_output.log_probs,
        &dirty_labels,
        &dirty_output.label_logits,
        &dirty_output.mask,
    )?;

    let total = loss.total.to_scalar::<f32>()?;
    let dirty_total = dirty_loss.total.to_scalar::<f32>()?;
    assert!(total.is_finite());
    assert!((total - dirty_total).abs() < 1e-5, "{total} vs {dirty_total}");
    assert!(loss.perplexity()? > 1.0);
    Ok(())
}

/// Rotation about a fixed oblique axis followed by a translation.
fn rigid_motion(chain: &ChainRecord) -> ChainRecord {
    let (x, y, z) = (0.48f32, -0.6, 0.64);
    let norm = (x * x + y * y + z * z).sqrt();
    let (x, y, z) = (x / norm, y / norm, z / norm);
    let (s, c) = 1.1f32.sin_cos();
    let t = 1.0 - c;
    let r = [
        [t * x * x + c, t * x * y - s * z, t * x * z + s * y],
        [t * x * y + s * z, t * y * y + c, t * y * z - s * x],
        [t * x * z - s * y, t * y * z + s * x, t * z * z + c],
    ];
    let shift = [12.0f32, -7.5, 3.25];
    let coords = chain
        .coords
        .iter()
        .map(|residue| {
            residue.map(|p| {
                let mut out = [0f32; 3];
                for (row, value) in out.iter_mut().enumerate() {
                    *value = r[row][0] * p[0] + r[row][1] * p[1] + r[row][2] * p[2] + shift[row];
                }
                out
            })
        })
        .collect();
    ChainRecord {
        coords,
        ..chain.clone()
    }
}

#[test]
fn test_rigid_motion_invariance() -> Result<()> {
    let device = Device::Cpu;
    let (_varmap, model) = load(&small_config())?;
    let chains = [jittered_chain(10, 1), jittered_chain(7, 2)];
    let moved: Vec<ChainRecord> = chains.iter().map(rigid_motion).collect();

    let batch = ProteinBatch::collate(&chains, &device)?;
    let moved = ProteinBatch::collate(&moved, &device)?;
    let mask = batch.mask.unsqueeze(D::Minus1)?;

    // the structure embeddings after invariant point attention
    let a = model.encode(&batch, false)?;
    let c = model.encode(&moved, false)?;
    // padded rows measure from the origin, so only real residues keep their neighbors
    let (idx_a, idx_c) = (a.e_idx.to_vec3::<u32>()?, c.e_idx.to_vec3::<u32>()?);
    assert_eq!(idx_a[0], idx_c[0]);
    assert_eq!(idx_a[1][..7], idx_c[1][..7]);
    let diff = max_abs_diff(&a.h_v.broadcast_mul(&mask)?, &c.h_v.broadcast_mul(&mask)?)?;
    assert!(diff < 2e-3, "diff {diff}");

    // f32 error accumulates through the decoder of an untrained network
    let a = model.forward(&batch, false)?;
    let c = model.forward(&moved, false)?;
    let diff = max_abs_diff(
        &a.log_probs.broadcast_mul(&mask)?,
        &c.log_probs.broadcast_mul(&mask)?,
    )?;
    assert!(diff < 1e-2, "diff {diff}");
    let diff = max_abs_diff(
        &a.label_logits.broadcast_mul(&mask)?,
        &c.label_logits.broadcast_mul(&mask)?,
    )?;
    assert!(diff < 1e-2, "diff {diff}");
    Ok(())
}

#[test]
fn test_crf_decode_padded_and_empty_chains() -> Result<()> {
    let device = Device::Cpu;
    let (_varmap, model) = load(&small_config())?;
    let batch = two_chain_batch(&device)?;
    let output = model.forward(&batch, false)?;

    let decoded = model.decode_crf(&output.label_logits, &batch.mask)?;
    assert_eq!(decoded.dims(), &[2, 10]);
    let rows = decoded.to_vec2::<u32>()?;
    assert!(rows.iter().flatten().all(|&tag| tag < 5));
    assert_eq!(rows[1][7..], [0; 3]);

    let empty = Tensor::zeros((2, 10), DType::F32, &device)?;
    let decoded = model.decode_crf(&output.label_logits, &empty)?;
    assert_eq!(decoded.to_vec2::<u32>()?, vec![vec![0; 10]; 2]);

    let labels = batch.labels.clone().expect("collated with labels");
    let nll = model
        .neg_loss_crf(&output.label_logits, &labels, &batch.mask)?
        .to_scalar::<f32>()?;
    assert!(nll.is_finite() && nll > 0.0);
    Ok(())
}

#[test]
fn test_degenerate_frame_policies() -> Result<()> {
    let device = Device::Cpu;
    let mut chain = jittered_chain(8, 3);
    // N collapses onto CA
    chain.coords[4][0] = chain.coords[4][1];

    let reject = TMPNNConfig {
        degenerate_frames: DegenerateFramePolicy::Reject,
        ..small_config()
    };
    let (_varmap, model) = load(&reject)?;
    let batch = ProteinBatch::collate(&[chain.clone()], &device)?;
    assert!(model.forward(&batch, false).is_err());

    let (_varmap, model) = load(&small_config())?;
    let output = model.forward(&batch, false)?;
    assert!(output
        .log_probs
        .flatten_all()?
        .to_vec1::<f32>()?
        .iter()
        .all(|v| v.is_finite()));

    let masking = TMPNNConfig {
        degenerate_frames: DegenerateFramePolicy::MaskResidue,
        ..small_config()
    };
    let (_varmap, model) = load(&masking)?;
    let encoded = model.encode(&batch, false)?;
    assert_eq!(encoded.mask.to_vec2::<f32>()?[0][4], 0.0);
    let output = model.forward(&batch, false)?;
    assert_eq!(output.mask.to_vec2::<f32>()?, encoded.mask.to_vec2::<f32>()?);
    let sampled = model.sample(
        &batch,
        &SampleConfig {
            temperature: 1.0,
            seed: Some(3),
        },
    )?;
    assert_eq!(sampled.mask.to_vec2::<f32>()?, encoded.mask.to_vec2::<f32>()?);
    assert_eq!(sampled.s.to_vec2::<u32>()?[0][4], PAD_TOKEN);
    Ok(())
}

#[test]
fn test_dropped_residue_is_excluded_from_loss() -> Result<()> {
    let device = Device::Cpu;
    let mut chain = jittered_chain(8, 3);
    chain.coords[4][0] = chain.coords[4][1];
    let config = TMPNNConfig {
        degenerate_frames: DegenerateFramePolicy::MaskResidue,
        ..small_config()
    };
    let (_varmap, model) = load(&config)?;
    let criterion = TMPNNLoss::default();

    let total_loss = |chain: &ChainRecord| -> Result<f32> {
        let batch = ProteinBatch::collate(&[chain.clone()], &device)?;
        let labels = batch.labels.clone().expect("collated with labels");
        let output = model.forward(&batch, false)?;
        let loss = criterion.compute(
            model.crf(),
            &batch.s,
            &output.log_probs,
            &labels,
            &output.label_logits,
            &output.mask,
        )?;
        Ok(loss.total.to_scalar::<f32>()?)
    };

    // a different residue and label at the dropped position
    let mut relabelled = chain.clone();
    relabelled.sequence.replace_range(4..5, "W");
    if let Some(labels) = relabelled.labels.as_mut() {
        labels[4] = (labels[4] + 2) % 5;
    }
    let a = total_loss(&chain)?;
    let c = total_loss(&relabelled)?;
    assert!(a.is_finite());
    assert!((a - c).abs() < 1e-5, "{a} vs {c}");
    Ok(())
}

#[test]
fn test_training_mode_is_stochastic() -> Result<()> {
    let device = Device::Cpu;
    let config = TMPNNConfig {
        noise_2d: 0.1,
        noise_3d: 0.02,
        ..small_config()
    };
    assert_eq!(config.noise_2d, TMPNNConfig::tmpnn_training().noise_2d);
    assert_eq!(config.noise_3d, TMPNNConfig::tmpnn_training().noise_3d);
    let (_varmap, model) = load(&config)?;
    let batch = two_chain_batch(&device)?;
    let mask = batch.mask.unsqueeze(D::Minus1)?;

    let first = model.forward(&batch, true)?;
    let second = model.forward(&batch, true)?;
    for output in [&first, &second] {
        assert!(output
            .log_probs
            .flatten_all()?
            .to_vec1::<f32>()?
            .iter()
            .all(|v| v.is_finite()));
    }
    let diff = max_abs_diff(
        &first.log_probs.broadcast_mul(&mask)?,
        &second.log_probs.broadcast_mul(&mask)?,
    )?;
    assert!(diff > 0.0);

    let a = model.forward(&batch, false)?;
    let c = model.forward(&batch, false)?;
    assert_eq!(max_abs_diff(&a.log_probs, &c.log_probs)?, 0.0);
    assert_eq!(max_abs_diff(&a.label_logits, &c.label_logits)?, 0.0);
    Ok(())
}

#[test]
fn test_config_json_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tmpnn.json");
    let config = TMPNNConfig {
        degenerate_frames: DegenerateFramePolicy::MaskResidue,
        offload_pair: true,
        ..small_config()
    };
    config.to_json_file(&path)?;
    let restored = TMPNNConfig::from_json_file(&path)?;
    assert_eq!(restored, config);

    std::fs::write(&path, r#"{"hidden_dim": 30, "num_heads": 4}"#)?;
    assert!(TMPNNConfig::from_json_file(&path).is_err());
    Ok(())
}
