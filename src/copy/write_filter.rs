//! Write filters turn validated page batches into backup output.

use std::sync::atomic::Ordering;

use tracing::debug;

use crate::{
    datasink::{self, Datasink, DatasinkFile},
    delta::{self, DeltaMeta, DeltaWriter},
    page, Result,
};

use super::{cursor::FileCursor, CopyCounters};

pub trait WriteFilter: Sync {
    type Ctx;

    fn init(&self, cursor: &FileCursor, sink: &dyn Datasink) -> Result<Self::Ctx>;

    fn process(&self, ctx: &mut Self::Ctx, cursor: &FileCursor, counters: &CopyCounters)
        -> Result<()>;

    fn finalize(&self, ctx: Self::Ctx, cursor: &FileCursor) -> Result<()>;
}

/// Streams every batch verbatim to the same relative path.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteThrough;

impl WriteFilter for WriteThrough {
    type Ctx = Box<dyn DatasinkFile>;

    fn init(&self, cursor: &FileCursor, sink: &dyn Datasink) -> Result<Self::Ctx> {
        sink.open(cursor.rel_path(), Some(cursor.size()))
    }

    fn process(
        &self,
        out: &mut Self::Ctx,
        cursor: &FileCursor,
        counters: &CopyCounters,
    ) -> Result<()> {
        let buf = cursor.buffer();
        out.write(buf.as_bytes())?;
        counters
            .pages_written
            .fetch_add(buf.page_count() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn finalize(&self, out: Self::Ctx, _cursor: &FileCursor) -> Result<()> {
        out.close()
    }
}

/// Keeps only pages newer than the base backup, packed into a `.delta`
/// file with a `.meta` companion.
#[derive(Debug, Clone, Copy)]
pub struct IncrementalDelta {
    incremental_lsn: u64,
}

impl IncrementalDelta {
    pub fn new(incremental_lsn: u64) -> Self {
        Self { incremental_lsn }
    }

    pub fn incremental_lsn(&self) -> u64 {
        self.incremental_lsn
    }
}

impl WriteFilter for IncrementalDelta {
    type Ctx = DeltaWriter;

    fn init(&self, cursor: &FileCursor, sink: &dyn Datasink) -> Result<DeltaWriter> {
        let page_size = cursor.page_size();
        let meta = DeltaMeta {
            page_size: page_size.logical,
            zip_size: page_size.zip,
            space_id: cursor.space_id(),
        };
        datasink::write_file(
            sink,
            &delta::meta_path(cursor.rel_path()),
            meta.to_text().as_bytes(),
        )?;
        let out = sink.open(&delta::delta_path(cursor.rel_path()), None)?;
        Ok(DeltaWriter::new(out, cursor.physical_page_size()))
    }

    fn process(
        &self,
        writer: &mut DeltaWriter,
        cursor: &FileCursor,
        counters: &CopyCounters,
    ) -> Result<()> {
        let first = cursor.batch_first_page();
        let mut written = 0u64;
        let mut skipped = 0u64;
        for (i, page) in cursor.buffer().pages().enumerate() {
            if page::page_lsn(page) <= self.incremental_lsn {
                skipped += 1;
                continue;
            }
            writer.push((first + i as u64) as u32, page)?;
            written += 1;
        }
        counters.pages_written.fetch_add(written, Ordering::Relaxed);
        counters.pages_skipped.fetch_add(skipped, Ordering::Relaxed);
        Ok(())
    }

    fn finalize(&self, writer: DeltaWriter, cursor: &FileCursor) -> Result<()> {
        let summary = writer.finish()?;
        debug!(
            thread = cursor.thread(),
            path = %cursor.rel_path().display(),
            clusters = summary.clusters,
            pages = summary.pages,
            "delta written"
        );
        Ok(())
    }
}
