use crate::{
    commands::exit_result::ExitResult,
    flags::Flags,
    log::LogInfo,
    perf_counters,
    session::{
        record_session::{self, RecordStatus},
        Session,
    },
    trace::trace_writer::TraceWriter,
    util::assert_page_size,
};
use std::ffi::OsString;

/// `retrace record <exe> [args...]`: spawn the tracee and run the record
/// loop until every task has exited.
pub fn run(exe: OsString, args: Vec<OsString>) -> ExitResult<()> {
    assert_page_size();
    perf_counters::init_pmu();
    perf_counters::check_working_counters();

    let use_syscall_buffer = !Flags::get().no_syscall_buffer;
    let writer = TraceWriter::new(&exe, -1);
    eprintln!(
        "retrace: Saving execution to trace directory `{}'.",
        writer.dir().display()
    );

    let session = Session::new_record(writer, use_syscall_buffer);
    record_session::spawn_tracee(&session, &exe, &args);

    let exit_code;
    loop {
        let result = record_session::record_step(&session);
        match result.status {
            RecordStatus::StepContinue => continue,
            RecordStatus::AllTasksExited => {
                exit_code = result.exit_code;
                break;
            }
        }
    }

    record_session::finish_recording(&session);
    log!(LogInfo, "Recording finished with exit code {}", exit_code);
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    ExitResult::Ok(())
}
