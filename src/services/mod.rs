pub mod email;
pub mod job_store;
pub mod ocr;
pub mod queue;
pub mod storage;
pub mod submitter;
