//! Offline export
//!
//! Forces every block of the mix to load on the export pool, then writes the
//! play buffer through an encoder at the requested rate. Runs on the heavy
//! queue, so look-ahead loads wait until the export is done.

use rayon::prelude::*;

use super::loader::LoadOutcome;
use super::player::EngineInner;
use crate::codec::AudioWriter;
use crate::dsp::resample_channels;
use crate::error::{EncodeError, EngineResult};

impl EngineInner {
    /// Render the whole mix into `writer` at `sample_rate`
    pub(crate) fn render_export(&self, mut writer: Box<dyn AudioWriter>, sample_rate: u32) -> EngineResult<()> {
        let mix = self.current_mix();
        let generation = self.shared.generation();
        let len = self.shared.lock_rt().play_buffer.len();
        let blocks = self.timing.block_count(len);
        let report = |message: &str| self.notifier.error(message);

        let outcomes: Vec<LoadOutcome> = self.export_pool.install(|| {
            (0..blocks)
                .into_par_iter()
                .map(|block| self.loader.load_block(block, generation, &mix, &self.shared, &report))
                .collect()
        });
        let loaded = outcomes.iter().filter(|o| **o == LoadOutcome::Loaded).count();
        if outcomes.contains(&LoadOutcome::Stale) {
            log::warn!("export: mix changed while loading blocks");
        }
        log::debug!("export: mixed {} of {} blocks", loaded, blocks);

        let (left, right) = self.shared.lock_rt().play_buffer.to_channels();
        let internal_rate = self.timing.sample_rate;
        let channels = if sample_rate != internal_rate {
            log::debug!("export: resampling {}Hz -> {}Hz", internal_rate, sample_rate);
            resample_channels(&[left, right], internal_rate, sample_rate)
                .map_err(|e| EncodeError::Write(e.to_string()))?
        } else {
            vec![left, right]
        };

        let frames = channels.first().map(|c| c.len()).unwrap_or(0);
        let chunk = self.timing.block_samples();
        let mut start = 0;
        while start < frames {
            let end = (start + chunk).min(frames);
            writer.write(&[&channels[0][start..end], &channels[1][start..end]])?;
            start = end;
        }
        writer.finalize()?;

        log::info!("Export finished: {} frames at {}Hz", frames, sample_rate);
        Ok(())
    }
}
