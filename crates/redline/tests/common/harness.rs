//! Test harness for isolated engine runs.
//!
//! Each `TestHarness` owns a temporary data directory, so the database and
//! stored files of one test never leak into another.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use redline::{
    Collaborators, CodecRegistry, Engine, EngineConfig, Job, ProgressEvent, SuggestionService,
};

pub struct TestHarness {
    temp_dir: TempDir,
    pub config: EngineConfig,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = EngineConfig::with_data_dir(temp_dir.path());
        Self { temp_dir, config }
    }

    pub fn data_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Opens an engine with the built-in rule suggester.
    pub fn engine(&self) -> Engine {
        Engine::open(self.config.clone()).expect("Failed to open engine")
    }

    /// Opens an engine with a scripted suggestion service.
    pub fn engine_with(&self, suggester: Arc<dyn SuggestionService>) -> Engine {
        Engine::with_collaborators(
            self.config.clone(),
            Collaborators {
                codecs: CodecRegistry::new(),
                suggester,
            },
        )
        .expect("Failed to open engine")
    }

    /// Uploads a document and submits a job for it.
    pub fn submit(&self, engine: &Engine, name: &str, bytes: &[u8]) -> Job {
        let file = engine.upload(bytes, name).expect("Failed to upload");
        engine.submit(&file.id).expect("Failed to submit")
    }

    /// Follows a job until its stream ends and returns every event seen
    /// along with the final job record.
    pub fn wait(&self, engine: &Engine, job_id: &str) -> (Vec<ProgressEvent>, Job) {
        let mut subscription = engine.subscribe(job_id).expect("Failed to subscribe");
        let mut events = Vec::new();
        while let Some(event) = subscription.blocking_next() {
            events.push(event);
        }
        let job = engine.job(job_id).expect("Job vanished");
        assert!(job.is_terminal(), "stream ended before job {} finished", job_id);
        (events, job)
    }
}

/// A minimal DOCX package whose body is `body`.
pub fn build_docx(body: &str) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    writer
        .start_file("[Content_Types].xml", options)
        .expect("start content types");
    writer
        .write_all(br#"<?xml version="1.0"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"/>"#)
        .expect("write content types");
    writer
        .start_file("word/document.xml", options)
        .expect("start document part");
    let document = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}<w:sectPr/></w:body></w:document>"#,
        body
    );
    writer
        .write_all(document.as_bytes())
        .expect("write document part");
    writer.finish().expect("finish docx").into_inner()
}
