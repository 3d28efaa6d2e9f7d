pub mod compressed_reader;
pub mod compressed_writer;
pub mod trace_frame;
pub mod trace_reader;
pub mod trace_stream;
pub mod trace_task_event;
pub mod trace_writer;
