use crate::{
    commands::exit_result::ExitResult,
    log::LogInfo,
    perf_counters,
    session::{
        record_session::spawn_tracee,
        replay_session::{self, ReplayStatus},
        Session,
    },
    trace::trace_reader::TraceReader,
    util::assert_page_size,
};
use std::path::PathBuf;

/// `retrace replay [trace-dir]`: drive the tracee through the recorded
/// event stream, injecting the recorded effects.
pub fn run(trace_dir: Option<PathBuf>) -> ExitResult<()> {
    assert_page_size();
    perf_counters::init_pmu();

    let exe = replay_session::find_initial_exe(trace_dir.as_deref());
    let reader = TraceReader::new(trace_dir.as_deref());
    let session = Session::new_replay(reader);

    // The replayed process starts from the recorded image; everything
    // after the exec is reconstructed from the trace.
    spawn_tracee(&session, &exe, &[]);

    loop {
        let result = replay_session::replay_step(&session);
        if result.status == ReplayStatus::ReplayedAllEvents {
            break;
        }
    }

    session.kill_all_tasks();
    log!(LogInfo, "Replay finished");
    ExitResult::Ok(())
}
