//! Hash partitioning, spilling and the per-bucket join loop.
//!
//! A *pass* partitions a build input and then a probe input into `fanout`
//! buckets at one recursion depth. The top-level pass reads the caller's
//! sources; deeper passes read a spilled parent bucket pair back from disk.
//! Every pass ends by joining its spilled buckets, which may start passes of
//! their own one level deeper.

use hhj_result::{Error, Result as HhjResult};
use hhj_storage::{BucketId, BucketRole};
use hhj_types::RowSource;

use crate::coordinator::JoinRun;
use crate::executor::HashIndex;
use crate::hashing::partition_for;

/// Buckets of one partition pass, indexed by partition number.
pub(crate) struct PassBuckets {
    depth: u32,
    build: Vec<BucketId>,
    probe: Vec<BucketId>,
    /// Hash index of each build bucket that stayed resident.
    indexes: Vec<Option<HashIndex>>,
    probe_rows: Vec<u64>,
}

impl PassBuckets {
    fn fanout(&self) -> usize {
        self.build.len()
    }
}

impl JoinRun<'_> {
    /// Partition every build row, spilling under memory pressure.
    ///
    /// Rows that can never match skip the buckets and go straight to the
    /// unmatched output.
    pub(crate) fn partition_build(
        &mut self,
        source: &mut dyn RowSource,
        depth: u32,
        fanout: usize,
        top_level: bool,
    ) -> HhjResult<PassBuckets> {
        let build = self.store.create_partitions(BucketRole::Build, depth, fanout);
        let probe = self.store.create_partitions(BucketRole::Probe, depth, fanout);
        self.monitor.buckets_created(fanout, depth);

        let mut since_pressure_check = 0usize;
        while let Some(row) = source.next_row()? {
            if top_level {
                source.schema().check_row(&row)?;
                self.monitor.build_row();
            }
            self.progress.row()?;

            match self.plan.build_key(&row)? {
                Some(key) => {
                    let id = build[partition_for(&key, depth, fanout)];
                    self.store.append(id, row)?;
                    // Children of an oversized bucket never stay resident
                    // past the limit.
                    if depth > 0
                        && self.store.resident_rows(id) > self.config.resident_bucket_rows
                    {
                        self.spill_bucket(id, "child bucket over resident limit")?;
                    }
                }
                None => {
                    if self.plan.emit_build_unmatched {
                        self.out.build_unmatched(&row);
                    }
                }
            }

            since_pressure_check += 1;
            if since_pressure_check >= self.config.pressure_check_rows {
                since_pressure_check = 0;
                self.relieve_pressure(&build)?;
            }
        }
        self.relieve_pressure(&build)?;

        tracing::debug!(
            depth,
            fanout,
            spilled = build.iter().filter(|&&id| self.store.is_spilled(id)).count(),
            "build input partitioned"
        );
        Ok(PassBuckets {
            depth,
            build,
            probe,
            indexes: (0..fanout).map(|_| None).collect(),
            probe_rows: vec![0; fanout],
        })
    }

    /// Spill one bucket if the memory monitor asks for it: the resident
    /// build bucket holding the most rows, lowest partition on ties.
    fn relieve_pressure(&mut self, buckets: &[BucketId]) -> HhjResult<()> {
        if !self.memory.is_under_pressure(self.spilled) {
            return Ok(());
        }
        let mut victim: Option<(BucketId, usize)> = None;
        for &id in buckets {
            let rows = self.store.resident_rows(id);
            if rows > 0 && victim.is_none_or(|(_, best)| rows > best) {
                victim = Some((id, rows));
            }
        }
        let Some((id, _)) = victim else {
            return Ok(());
        };
        self.spill_bucket(id, "memory pressure")
    }

    fn spill_bucket(&mut self, id: BucketId, reason: &'static str) -> HhjResult<()> {
        let rows = self.store.resident_rows(id);
        self.store.spill(id)?;
        self.spilled += 1;
        self.monitor.bucket_spilled();
        tracing::debug!(bucket = %id, rows, spilled = self.spilled, reason, "spilled build bucket");
        if !self.warned_spill {
            self.warned_spill = true;
            tracing::warn!(
                "hash join is spilling to disk; running with more memory would speed it up"
            );
        }
        Ok(())
    }

    /// Build a hash index for every bucket still resident after the build
    /// pass. Indexing completes before any probe row is looked at.
    pub(crate) fn index_resident(&mut self, pass: &mut PassBuckets) -> HhjResult<()> {
        for (partition, &id) in pass.build.iter().enumerate() {
            if self.store.is_spilled(id) {
                continue;
            }
            let rows = self.store.drain_resident(id)?;
            pass.indexes[partition] = Some(HashIndex::build(rows, &self.plan)?);
        }
        Ok(())
    }

    /// Route every probe row: joined now if its bucket is indexed, written to
    /// the bucket's probe file otherwise.
    pub(crate) fn partition_probe(
        &mut self,
        source: &mut dyn RowSource,
        pass: &mut PassBuckets,
        top_level: bool,
    ) -> HhjResult<()> {
        let fanout = pass.fanout();
        while let Some(row) = source.next_row()? {
            if top_level {
                source.schema().check_row(&row)?;
            }
            self.progress.row()?;

            let Some(key) = self.plan.probe_key(&row)? else {
                if top_level {
                    self.monitor.probe_row_unmatchable();
                }
                if self.plan.emit_probe_unmatched {
                    self.out.probe_unmatched(&row);
                }
                continue;
            };

            let partition = partition_for(&key, pass.depth, fanout);
            pass.probe_rows[partition] += 1;
            match pass.indexes[partition].as_mut() {
                Some(index) => {
                    if top_level {
                        self.monitor.probe_row_in_memory();
                    }
                    let matched = index.probe(&row, &key, &self.plan, &mut self.out);
                    if !matched && self.plan.emit_probe_unmatched {
                        self.out.probe_unmatched(&row);
                    }
                }
                None => {
                    if top_level {
                        self.monitor.probe_row_from_disk();
                    }
                    let id = pass.probe[partition];
                    if !self.store.is_spilled(id) {
                        self.store.spill(id)?;
                    }
                    self.store.append(id, row)?;
                }
            }
        }
        Ok(())
    }

    /// Finish the resident buckets of a pass: unmatched build rows out,
    /// indexes and their unused probe buckets released.
    pub(crate) fn finish_resident(&mut self, pass: &mut PassBuckets) -> HhjResult<()> {
        for partition in 0..pass.fanout() {
            let Some(index) = pass.indexes[partition].take() else {
                continue;
            };
            let build_rows = index.len() as u64;
            index.finish(&self.plan, &mut self.out);
            self.store.close(pass.probe[partition])?;
            self.monitor
                .bucket_joined(build_rows, pass.probe_rows[partition]);
        }
        Ok(())
    }

    /// Join every spilled bucket pair of a pass, in partition order.
    pub(crate) fn join_spilled(&mut self, pass: PassBuckets) -> HhjResult<()> {
        for partition in 0..pass.fanout() {
            let build = pass.build[partition];
            if !self.store.is_spilled(build) {
                continue;
            }
            self.progress.checkpoint()?;
            self.join_spilled_bucket(build, pass.probe[partition], pass.depth)?;
        }
        Ok(())
    }

    fn join_spilled_bucket(
        &mut self,
        build: BucketId,
        probe: BucketId,
        depth: u32,
    ) -> HhjResult<()> {
        let build_rows = self.store.info(build)?.rows;
        let probe_rows = self.store.info(probe)?.rows;
        self.progress.expect_more(build_rows + probe_rows);

        if build_rows > self.config.resident_bucket_rows as u64 {
            if depth < self.config.max_recursion_depth {
                return self.repartition(build, probe, depth);
            }
            tracing::warn!(
                bucket = %build,
                depth,
                rows = build_rows,
                "recursion limit reached; joining bucket by block-nested-loop"
            );
            self.monitor.recursion_fallback();
            return self.block_nested_loop(build, probe, build_rows);
        }

        let mut rows = Vec::with_capacity(build_rows as usize);
        {
            let mut reader = self.store.reload(build)?;
            while let Some(row) = reader.next_row()? {
                self.progress.row()?;
                rows.push(row);
            }
        }
        self.store.close(build)?;

        let mut index = HashIndex::build(rows, &self.plan)?;
        if self.store.is_spilled(probe) {
            let mut reader = self.store.reload(probe)?;
            while let Some(row) = reader.next_row()? {
                self.progress.row()?;
                index.probe_row(&row, &self.plan, &mut self.out)?;
            }
        }
        self.store.close(probe)?;
        index.finish(&self.plan, &mut self.out);
        self.monitor.bucket_joined(build_rows, probe_rows);
        tracing::debug!(bucket = %build, depth, build_rows, probe_rows, "joined spilled bucket");
        Ok(())
    }

    /// Replace an oversized bucket pair by `recursion_fanout` children one
    /// level deeper, then join the children.
    fn repartition(&mut self, build: BucketId, probe: BucketId, depth: u32) -> HhjResult<()> {
        let child_depth = depth + 1;
        let fanout = self.config.recursion_fanout;
        self.monitor.bucket_repartitioned();
        tracing::debug!(bucket = %build, depth = child_depth, fanout, "re-partitioning oversized bucket");

        let mut pass = {
            let mut reader = self.store.reload(build)?;
            self.partition_build(&mut reader, child_depth, fanout, false)?
        };
        self.store.close(build)?;
        self.index_resident(&mut pass)?;

        if self.store.is_spilled(probe) {
            let mut reader = self.store.reload(probe)?;
            self.partition_probe(&mut reader, &mut pass, false)?;
        }
        self.store.close(probe)?;
        self.finish_resident(&mut pass)?;
        self.join_spilled(pass)
    }

    /// Join a bucket pair that is too large for memory and cannot be split
    /// further: build rows are indexed in blocks of `resident_bucket_rows`
    /// and the probe bucket is re-read once per block.
    fn block_nested_loop(
        &mut self,
        build: BucketId,
        probe: BucketId,
        build_rows: u64,
    ) -> HhjResult<()> {
        let block_rows = self.config.resident_bucket_rows;
        let probe_spilled = self.store.is_spilled(probe);
        let mut probe_matched: Vec<bool> = Vec::new();
        let mut build_reader = self.store.reload(build)?;
        let mut rows_read = 0u64;
        let mut blocks = 0usize;

        loop {
            let mut block = Vec::with_capacity(block_rows);
            while block.len() < block_rows {
                match build_reader.next_row()? {
                    Some(row) => {
                        self.progress.row()?;
                        block.push(row);
                    }
                    None => break,
                }
            }
            rows_read += block.len() as u64;
            let last = block.len() < block_rows || rows_read >= build_rows;
            blocks += 1;

            let mut index = HashIndex::build(block, &self.plan)?;
            if probe_spilled {
                self.progress.expect_more(self.store.info(probe)?.rows);
                let mut reader = self.store.reload(probe)?;
                let mut position = 0usize;
                while let Some(row) = reader.next_row()? {
                    self.progress.row()?;
                    let key = self.plan.probe_key(&row)?.ok_or_else(|| {
                        Error::Internal(format!(
                            "probe row {} without a matchable key in a bucket",
                            row.id
                        ))
                    })?;
                    let hit = index.probe(&row, &key, &self.plan, &mut self.out);
                    if position == probe_matched.len() {
                        probe_matched.push(false);
                    }
                    probe_matched[position] |= hit;
                    if last && !probe_matched[position] && self.plan.emit_probe_unmatched {
                        self.out.probe_unmatched(&row);
                    }
                    position += 1;
                }
            }
            index.finish(&self.plan, &mut self.out);
            if last {
                break;
            }
        }
        drop(build_reader);

        let probe_rows = self.store.info(probe)?.rows;
        self.store.close(build)?;
        self.store.close(probe)?;
        self.monitor.bucket_joined(build_rows, probe_rows);
        tracing::debug!(bucket = %build, blocks, build_rows, probe_rows, "block-nested-loop join finished");
        Ok(())
    }
}
