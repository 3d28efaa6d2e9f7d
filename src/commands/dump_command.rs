use crate::{
    commands::exit_result::ExitResult,
    trace::trace_reader::TraceReader,
};
use std::path::PathBuf;

/// `retrace dump [trace-dir]`: print every frame of the trace.
pub fn run(trace_dir: Option<PathBuf>, raw: bool) -> ExitResult<()> {
    let mut reader = TraceReader::new(trace_dir.as_deref());

    while !reader.at_end() {
        let frame = reader.read_frame();
        let result = if raw {
            frame.dump_raw(None)
        } else {
            frame.dump(None)
        };
        if let Err(e) = result {
            return ExitResult::err_from(e, 1);
        }
    }

    println!(
        "trace: {} compressed bytes, {} uncompressed",
        reader.compressed_bytes(),
        reader.uncompressed_bytes()
    );
    ExitResult::Ok(())
}
