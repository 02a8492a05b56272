//! Dump the emitted translation unit for one specialization.
//!
//! Prints the device source a parameter point would compile to, without
//! touching any driver:
//!
//! ```text
//! kernel_dump --backend opencl --dtype f32 --trans TN \
//!             --params 4,16,16,16,1,4,4,4,4,64 --suffix _tuned
//! ```
//!
//! `--params` is the tuner's flattened vector
//! `(simd, ls0, kL, ls1, depth, mS, kS, nS, lf0, lf1)`; both fetch
//! schedules are the shared-memory staging path. `--check-bounds` selects
//! the fallback flavor. The point is validated against a capability record
//! for the chosen backend first; an invalid point exits nonzero with the
//! oracle's message.

use anyhow::{anyhow, bail, Result};
use gemmforge::{
    emit, Backend, Device, Dtype, FetchingPolicy, GemmParameters, SpecializationKey, Trans,
};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn has_flag(args: &[String], key: &str) -> bool {
    args.iter().any(|a| a == key)
}

fn parse_params(text: &str) -> Result<GemmParameters> {
    let fields: Vec<u32> = text
        .split(',')
        .map(|f| f.trim().parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow!("bad --params field: {e}"))?;
    if fields.len() != 10 {
        bail!("--params wants 10 comma-separated fields, got {}", fields.len());
    }
    Ok(GemmParameters::new(
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        fields[4],
        fields[5],
        fields[6],
        fields[7],
        FetchingPolicy::Local,
        FetchingPolicy::Local,
        fields[8],
        fields[9],
    ))
}

fn parse_trans(text: &str) -> Result<(Trans, Trans)> {
    match text {
        "NN" => Ok((Trans::N, Trans::N)),
        "NT" => Ok((Trans::N, Trans::T)),
        "TN" => Ok((Trans::T, Trans::N)),
        "TT" => Ok((Trans::T, Trans::T)),
        other => bail!("unknown --trans {other} (want NN/NT/TN/TT)"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let backend = match parse_flag(&args, "--backend").as_deref() {
        None | Some("cuda") => Backend::Cuda,
        Some("opencl") => Backend::OpenCl,
        Some("host") => Backend::Host,
        Some(other) => bail!("unknown --backend {other}"),
    };
    let dtype = match parse_flag(&args, "--dtype").as_deref() {
        None | Some("f32") => Dtype::F32,
        Some("f64") => Dtype::F64,
        Some(other) => bail!("unknown --dtype {other}"),
    };
    let (a_trans, b_trans) =
        parse_trans(parse_flag(&args, "--trans").as_deref().unwrap_or("NN"))?;
    let params = parse_params(
        parse_flag(&args, "--params")
            .as_deref()
            .unwrap_or("1,8,8,8,1,4,4,4,8,8"),
    )?;
    let suffix = parse_flag(&args, "--suffix").unwrap_or_default();
    let check_bounds = has_flag(&args, "--check-bounds");

    let device = match backend {
        Backend::Cuda => Device::cuda_reference(),
        Backend::OpenCl => Device::opencl_reference(),
        Backend::Host => Device::host(),
    };
    if let Err(e) = gemmforge::check(&params, &device, dtype, a_trans, b_trans) {
        bail!("parameter point rejected ({}): {e}", e.code());
    }

    let key = SpecializationKey { params, a_trans, b_trans, check_bounds, backend, dtype };
    tracing::info!(digest = %key.digest(), "specialization");
    print!("{}", emit::generate(&key, &suffix));
    Ok(())
}
