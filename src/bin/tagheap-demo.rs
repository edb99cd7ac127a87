//! Allocate a few blocks, forget one, and look at the report.
//!
//! ```plaintext
//! TAGHEAP_DIAGNOSTICS=1 RUST_LOG=info cargo run --bin tagheap-demo -- report.json
//! ```

use std::{env, process::ExitCode};

use log::{error, info};
use tagheap::{AllocError, InstrumentedAlloc};

#[derive(Debug)]
#[allow(dead_code)]
struct Vertex {
    position: [f32; 3],
    normal: [f32; 3],
}

fn run(heap: &InstrumentedAlloc) -> Result<(), AllocError> {
    let scratch = heap.allocate_tagged(4096, "Scratch")?;
    let vertices = heap.allocate_typed::<Vertex>(128)?;
    let _forgotten = heap.allocate_tagged(100, "Forgotten")?;

    // SAFETY: all of these came from `heap` and are freed exactly once
    let scratch = unsafe { heap.reallocate(scratch.as_ptr(), 8192)? };
    unsafe {
        heap.free(scratch.as_ptr())?;
        heap.free(vertices.as_ptr().cast())?;
    }
    info!("{:?}", heap.stats());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let heap = InstrumentedAlloc::default();
    if let Err(err) = run(&heap) {
        error!("{err}");
        return ExitCode::FAILURE;
    }

    let report = heap.shutdown();
    print!("{report}");
    if let Some(path) = env::args().nth(1) {
        if let Err(err) = report.write_to_file(&path) {
            error!("writing {path}: {err}");
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}
