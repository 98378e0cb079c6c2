//! The MOD playback engine: row/tick state machine (spec §4.4), sequencer
//! (spec §4.5) and the frame loop that drives the mixer and a [`Sink`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{Config, PlayMode};
use crate::engine::channel::{ChannelState, DelaySpeed, Rng, Waveform, FUNK_TABLE};
use crate::engine::effects::{remember, Effect};
use crate::error::ModError;
use crate::mixer::{self, GlobalFilter};
use crate::sink::Sink;
use crate::song::{Cell, Module};
use crate::tracker::{PeriodTable, TableKind};

/// Fixed per spec §8's reference-rendering requirement: a fixed random seed
/// makes vibrato/tremolo's random waveform reproducible across runs.
const RANDOM_SEED: u64 = 23;

pub struct ModEngine {
    module: Module,
    table: PeriodTable,
    legacy: bool,
    interpolate: bool,
    amplify: f32,
    play_mode: PlayMode,
    sample_rate: u32,
    max_loops: u32,
    channel_only: Option<usize>,
    cancel: Option<Arc<AtomicBool>>,
    verbose: bool,

    channels: Vec<ChannelState>,
    row_effects: Vec<Effect>,
    current_row_cells: Vec<Cell>,

    order_index: usize,
    row_index: usize,
    effective_start: usize,
    effective_end: usize,

    tick: u8,
    ticks_per_row: u8,
    tempo_bpm: u16,
    samples_per_tick: f64,
    frames_left_in_tick: f64,

    pending_pattern_delay: u8,
    row_is_repeating: bool,
    pattern_delay_this_row: bool,

    next_order: Option<u8>,
    next_row: Option<u8>,
    visited: HashSet<(usize, usize)>,
    loops_completed: u32,
    finished: bool,

    rng: Rng,
    global_filter: GlobalFilter,
}

impl ModEngine {
    pub fn new(module: Module, config: &Config) -> Self {
        let table = PeriodTable::select(module.table_kind);
        let mut channels = vec![ChannelState::new(); module.channel_count as usize];
        for channel in channels.iter_mut() {
            channel.configure_dsp_buffers(config.sample_rate);
        }

        let effective_start = config.start_pos as usize;
        let effective_end = match config.patterns_count {
            Some(n) => ((config.start_pos as u32 + n as u32).min(module.song_length as u32)) as usize,
            None => module.song_length as usize,
        };

        let mut engine = ModEngine {
            module,
            table,
            legacy: config.legacy,
            interpolate: config.interpolate,
            amplify: config.amplify,
            play_mode: config.play_mode,
            sample_rate: config.sample_rate.max(1),
            max_loops: config.loops.max(1),
            channel_only: None,
            cancel: None,
            verbose: config.verbose,

            row_effects: vec![Effect::Arpeggio(0, 0); channels.len()],
            channels,
            current_row_cells: Vec::new(),

            order_index: effective_start,
            row_index: 0,
            effective_start,
            effective_end: effective_end.max(effective_start + 1),

            tick: 0,
            ticks_per_row: 6,
            tempo_bpm: 125,
            samples_per_tick: 0.0,
            frames_left_in_tick: 0.0,

            pending_pattern_delay: 0,
            row_is_repeating: false,
            pattern_delay_this_row: false,

            next_order: None,
            next_row: None,
            visited: HashSet::new(),
            loops_completed: 0,
            finished: false,

            rng: Rng::new(RANDOM_SEED),
            global_filter: GlobalFilter::default(),
        };
        engine.recompute_samples_per_tick();
        engine
    }

    pub fn set_cancel_flag(&mut self, cancel: Arc<AtomicBool>) {
        self.cancel = Some(cancel);
    }

    /// Restricts output to a single channel's contribution, for per-channel
    /// render mode (spec §4.7).
    pub fn render_channel_only(&mut self, channel: usize) {
        self.channel_only = Some(channel);
    }

    fn recompute_samples_per_tick(&mut self) {
        self.samples_per_tick = (2500.0 / self.tempo_bpm.max(1) as f64) * (self.sample_rate as f64 / 1000.0);
    }

    fn output_channels(&self) -> u16 {
        if self.play_mode.is_stereo() {
            2
        } else {
            1
        }
    }

    /// Drives the engine to completion, writing frames to `sink`.
    pub fn run(&mut self, sink: &mut dyn Sink) -> Result<(), ModError> {
        sink.begin(self.sample_rate, self.output_channels())?;
        let result = self.run_inner(sink);
        match &result {
            Ok(()) => sink.end(),
            Err(_) => {
                let _ = sink.end();
                result.clone_err()
            }
        }
    }

    fn run_inner(&mut self, sink: &mut dyn Sink) -> Result<(), ModError> {
        let stereo = self.output_channels() == 2;
        let mut frame = [0i16; 2];
        while !self.finished {
            if self.frames_left_in_tick < 1.0 {
                self.advance_tick()?;
                if self.finished {
                    break;
                }
            }
            let (left, right) = self.mix_frame();
            if stereo {
                frame[0] = left;
                frame[1] = right;
                sink.write_frame(&frame[..2])?;
            } else {
                frame[0] = mixer::clamp_i16((left as f32 + right as f32) / 2.0);
                sink.write_frame(&frame[..1])?;
            }
            self.frames_left_in_tick -= 1.0;
        }
        Ok(())
    }

    // -- tick/row scheduling -------------------------------------------------

    fn advance_tick(&mut self) -> Result<(), ModError> {
        if self.tick == 0 {
            if self.row_is_repeating {
                self.rescan_tempo();
            } else {
                self.enter_row()?;
            }
        }
        self.apply_tick_effects();
        self.recompute_channel_frequencies();

        self.tick += 1;
        if self.tick >= self.ticks_per_row.max(1) {
            self.tick = 0;
            if self.pending_pattern_delay > 0 {
                self.pending_pattern_delay -= 1;
                self.row_is_repeating = true;
            } else {
                self.row_is_repeating = false;
                self.advance_position();
            }
        }
        self.frames_left_in_tick += self.samples_per_tick;
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), ModError> {
        if let Some(cancel) = &self.cancel {
            if cancel.load(Ordering::Relaxed) {
                return Err(ModError::Cancelled);
            }
        }
        Ok(())
    }

    fn apply_tempo(&mut self, param: u8) {
        match param {
            0 => {}
            1..=31 => self.ticks_per_row = param,
            _ => {
                self.tempo_bpm = param as u16;
                self.recompute_samples_per_tick();
            }
        }
    }

    fn rescan_tempo(&mut self) {
        let cells = self.current_row_cells.clone();
        for cell in &cells {
            if cell.effect == 0xf {
                self.apply_tempo(cell.param);
            }
        }
    }

    fn enter_row(&mut self) -> Result<(), ModError> {
        self.check_cancelled()?;
        if self.verbose && self.tick == 0 {
            self.print_row();
        }

        self.pattern_delay_this_row = false;
        let pattern = self.module.pattern_for_order(self.order_index);
        let row = pattern.rows[self.row_index.min(pattern.rows.len() - 1)].clone();
        self.current_row_cells = row.clone();

        for cell in &row {
            if cell.effect == 0xf {
                self.apply_tempo(cell.param);
            }
        }

        for (idx, cell) in row.into_iter().enumerate() {
            self.enter_row_channel(idx, cell);
        }
        Ok(())
    }

    fn print_row(&self) {
        let names: Vec<String> = self
            .current_row_cells
            .iter()
            .map(|c| {
                if c.period == 0 {
                    "---".to_string()
                } else {
                    crate::tracker::period_to_note_name(&self.table, c.period)
                        .unwrap_or_else(|| "???".to_string())
                }
            })
            .collect();
        println!("{:02}: {}", self.row_index, names.join(" "));
    }

    fn enter_row_channel(&mut self, idx: usize, cell: Cell) {
        let effect = Effect::decode(cell.effect, cell.param);
        self.row_effects[idx] = effect;
        let legacy = self.legacy;
        let ticks_per_row = self.ticks_per_row;
        let table = self.table;
        let module_channel_count = self.module.channel_count;

        let new_sample = if cell.sample_number != 0 {
            Some(self.module.resolve_sample(cell.sample_number))
        } else {
            None
        };

        // Extended effects that set persistent channel state (not the
        // tick-time fine-slide/retrigger/cut/delay ones, handled per-tick).
        if let Effect::Extended(sub, param) = effect {
            let channel = &mut self.channels[idx];
            match sub {
                0x0 if !legacy => match param {
                    0x2 => channel.bass_filter = true,
                    0x3 => channel.bass_filter = false,
                    0x4 => channel.channel_delay = Some(DelaySpeed::Fast),
                    0x5 => channel.channel_delay = Some(DelaySpeed::Slow),
                    0x6 => channel.channel_delay = None,
                    0x7 => channel.reverse = true,
                    0x8 => channel.reverse = false,
                    _ => {}
                },
                0x3 => channel.glissando = param != 0,
                0x4 => {
                    channel.vibrato.waveform = Waveform::from_nibble(param, legacy);
                    channel.vibrato.retrigger_on_note = param % 8 < 4;
                }
                0x5 => {
                    if param == 0 {
                        if !legacy {
                            channel.finetune = 0;
                        }
                    } else {
                        channel.finetune = param;
                    }
                }
                0x6 => match param {
                    0 => channel.loop_row = Some(self.row_index),
                    n => {
                        if channel.loop_count == 0 {
                            channel.loop_count = n;
                            channel.request_loop = true;
                        } else {
                            channel.loop_count -= 1;
                            if channel.loop_count != 0 {
                                channel.request_loop = true;
                            }
                        }
                    }
                },
                0x7 => {
                    channel.tremolo.waveform = Waveform::from_nibble(param, legacy);
                    channel.tremolo.retrigger_on_note = param % 8 < 4;
                }
                0x8 if !legacy => {
                    channel.pan = if param >= 15 {
                        1.0
                    } else {
                        (param as f32 / 15.0) * 2.0 - 1.0
                    };
                }
                0x9 => channel.retrig_speed = param,
                0xc => {
                    channel.note_cut = if (param as u8) < ticks_per_row {
                        Some(param)
                    } else {
                        None
                    };
                }
                0xd => {
                    channel.note_delay = if (param as u8) < ticks_per_row {
                        Some(param as i8)
                    } else {
                        Some(-2)
                    };
                }
                0xe => {
                    if param > 0 {
                        self.pending_pattern_delay = param;
                        self.pattern_delay_this_row = true;
                    }
                }
                0xf => channel.funk_speed = FUNK_TABLE[(param & 0x0f) as usize],
                _ => {}
            }
        }

        let channel = &mut self.channels[idx];

        // Tone portamento: update target/memory before the period branch
        // below decides whether to retrigger.
        let tone_requested = matches!(effect, Effect::TonePorta(_) | Effect::TonePortaVolSlide(_, _));
        if tone_requested {
            let raw_param = if let Effect::TonePorta(p) = effect {
                p
            } else if let Effect::TonePortaVolSlide(up, down) = effect {
                // memory nibble re-use doesn't apply to combined 5xy: no new
                // slide rate is encoded in this row, keep the existing one.
                let _ = (up, down);
                0
            } else {
                0
            };
            if raw_param != 0 {
                channel.tone_memory = raw_param as u16;
            } else if channel.tone_memory == 0 {
                channel.tone_memory = 1;
            }
            if cell.period != 0 {
                channel.tone_period = table.finetuned_period(cell.period, channel.finetune);
            } else if channel.tone_period == 0 {
                channel.tone_period = channel.period;
            }
            channel.tone_sliding = true;
        } else if cell.period != 0 {
            channel.tone_sliding = false;
        }

        // Arpeggio only stays active on rows that actually carry it again;
        // any other effect (including a bare `0x0` with param 0) clears it,
        // or the triad would keep arpeggiating into unrelated later rows.
        if let Effect::Arpeggio(x, y) = effect {
            channel.arp_x = x;
            channel.arp_y = y;
        } else {
            channel.arp_x = 0;
            channel.arp_y = 0;
        }
        channel.arp_counter = 0;

        if let Effect::Vibrato(speed, depth) | Effect::VibratoVolSlide(speed, depth) = effect {
            channel.vibrato.speed = remember(speed, channel.vibrato.speed);
            channel.vibrato.depth = remember(depth, channel.vibrato.depth);
        }
        if let Effect::Tremolo(speed, depth) = effect {
            channel.tremolo.speed = remember(speed, channel.tremolo.speed);
            channel.tremolo.depth = remember(depth, channel.tremolo.depth);
        }

        // Offset memory updates unconditionally on a non-zero parameter;
        // the byte position itself is only written once the sample/period
        // trigger below actually fires (applying it here would just be
        // clobbered by that trigger's reset of `sample_position`).
        if let Effect::SetOffset(param) = effect {
            if param != 0 {
                channel.offset_memory = param as u32;
            }
        }

        if let Effect::SetPan(param) = effect {
            channel.pan = if param >= 255 {
                1.0
            } else {
                (param as f32 - 128.0) / 128.0
            };
        }

        if let Effect::SetVolume(param) = effect {
            channel.set_volume(param);
        }

        if let Effect::PositionBreak(param) = effect {
            self.next_order = Some(param);
        }
        if let Effect::RowBreak(row) = effect {
            self.next_row = Some(row);
        }

        // Sample number / period semantics (spec §4.4.4).
        let note_delay_pending = matches!(channel.note_delay, Some(n) if n >= 0);
        match (new_sample, cell.period) {
            (None, 0) => {}
            (Some(sample_idx), 0) => {
                if !note_delay_pending {
                    let volume = self.module.samples[sample_idx].volume;
                    let current = &self.module.samples[channel.sample_index];
                    let defer = channel.playing && current.is_looping() && current.loop_start == 0;
                    let channel = &mut self.channels[idx];
                    channel.set_volume(volume);
                    if defer && sample_idx != channel.sample_index {
                        channel.cued_sample = Some(sample_idx);
                        channel.full_sample_then_loop = true;
                    } else {
                        channel.sample_index = sample_idx;
                        channel.finetune = self.module.samples[sample_idx].finetune;
                    }
                } else {
                    channel.pending_volume = Some(self.module.samples[sample_idx].volume);
                }
            }
            (sample_opt, period) => {
                let sample_idx = sample_opt.unwrap_or(channel.sample_index);
                let finetuned = table.finetuned_period(period, channel.finetune);
                if note_delay_pending {
                    channel.pending_sample = Some(sample_idx);
                    channel.pending_period = Some(finetuned);
                    channel.pending_row_period = Some(period);
                    if let Some(sample) = sample_opt {
                        channel.pending_volume = Some(self.module.samples[sample].volume);
                    }
                    if matches!(effect, Effect::SetOffset(_)) {
                        channel.pending_offset = Some(channel.offset_memory);
                    }
                } else if channel.tone_sliding {
                    if let Some(sample) = sample_opt {
                        channel.sample_index = sample;
                        channel.finetune = self.module.samples[sample].finetune;
                    }
                } else {
                    if let Some(sample) = sample_opt {
                        channel.sample_index = sample;
                        channel.finetune = self.module.samples[sample].finetune;
                        channel.set_volume(self.module.samples[sample].volume);
                    }
                    // `row_period` keeps the raw (un-finetuned) cell period:
                    // arpeggio looks it up in the finetune-0 row and only
                    // applies the channel's finetune to the shifted result
                    // (spec §4.4.6), so storing the already-finetuned period
                    // here would make that lookup fail for any non-zero
                    // finetune and silently disable arpeggio on the note.
                    trigger_sample(channel, &self.module, period, finetuned);
                    if matches!(effect, Effect::SetOffset(_)) {
                        let length = self.module.samples[channel.sample_index].length as u32;
                        channel.sample_position = (channel.offset_memory * 256).min(length) as f64;
                    }
                }
            }
        }
        let _ = module_channel_count;
    }

    fn apply_tick_effects(&mut self) {
        let t = self.tick;
        let legacy = self.legacy;
        let table = self.table;
        let ticks_per_row = self.ticks_per_row;
        let (lowest, highest) = table.legacy_extremes();

        for idx in 0..self.channels.len() {
            let effect = self.row_effects[idx];
            let channel = &mut self.channels[idx];

            match effect {
                Effect::PortaUp(step) if t > 0 => {
                    channel.period = channel
                        .period
                        .saturating_sub(step as u16)
                        .max(table.arp_period_cap());
                }
                Effect::PortaDown(step) if t > 0 => {
                    channel.period = channel.period.saturating_add(step as u16);
                }
                Effect::TonePorta(_) | Effect::TonePortaVolSlide(_, _) if t > 0 => {
                    advance_tone_portamento(channel);
                }
                _ => {}
            }

            match effect {
                Effect::VolSlide(up, down)
                | Effect::TonePortaVolSlide(up, down)
                | Effect::VibratoVolSlide(up, down)
                    if t > 0 =>
                {
                    if up > 0 {
                        channel.set_volume(channel.volume.saturating_add(up));
                    } else if down > 0 {
                        channel.set_volume(channel.volume.saturating_sub(down));
                    }
                }
                _ => {}
            }

            if matches!(
                effect,
                Effect::Vibrato(_, _) | Effect::VibratoVolSlide(_, _)
            ) && t > 0
            {
                channel.vibrato.advance();
            }
            if matches!(effect, Effect::Tremolo(_, _)) && t > 0 {
                channel.tremolo.advance();
            }

            if let Effect::Extended(sub, param) = effect {
                match sub {
                    0x1 if t == 0 => {
                        channel.period = channel
                            .period
                            .saturating_sub(param as u16)
                            .max(table.arp_period_cap());
                    }
                    0x2 if t == 0 => {
                        channel.period = channel.period.saturating_add(param as u16);
                    }
                    0xa if t == 0 => channel.set_volume(channel.volume.saturating_add(param)),
                    0xb if t == 0 => channel.set_volume(channel.volume.saturating_sub(param)),
                    0x9 if channel.retrig_speed > 0 && t > 0 => {
                        if t % channel.retrig_speed == 0 {
                            channel.sample_position = 0.0;
                        }
                    }
                    _ => {}
                }
            }

            if t > 0 {
                if let Some(cut) = channel.note_cut {
                    if cut > 0 {
                        channel.note_cut = Some(cut - 1);
                        if cut - 1 == 0 {
                            channel.volume = 0;
                        }
                    }
                }
                if let Some(delay) = channel.note_delay {
                    if delay > 0 {
                        channel.note_delay = Some(delay - 1);
                        if delay - 1 == 0 {
                            apply_delayed_trigger(channel, &self.module, legacy);
                        }
                    }
                }
            }

            if channel.funk_speed > 0 {
                channel.funk_accum += channel.funk_speed as u16;
                while channel.funk_accum >= 128 {
                    channel.funk_accum -= 128;
                    advance_funk(channel, &mut self.module);
                }
            }

            channel.clamp_legacy(self.module.table_kind, lowest, highest);
        }
        let _ = ticks_per_row;
    }

    fn recompute_channel_frequencies(&mut self) {
        let table = self.table;
        let legacy = self.legacy;
        let t = self.tick;

        for idx in 0..self.channels.len() {
            let channel = &mut self.channels[idx];
            if channel.period == 0 {
                channel.frequency = 0.0;
                continue;
            }

            let effective_period = if channel.glissando {
                table.nearest_period(channel.period, channel.finetune)
            } else if channel.arp_x != 0 || channel.arp_y != 0 {
                let semis = match channel.arp_counter % 3 {
                    1 => channel.arp_x,
                    2 => channel.arp_y,
                    _ => 0,
                };
                channel.arp_counter = channel.arp_counter.wrapping_add(1);
                let (period, _finetune) = arpeggio_period(&table, channel.row_period, channel.finetune, semis);
                period
            } else {
                let vib = if t > 0 { channel.vibrato.value(&mut self.rng) } else { 0 };
                (channel.period as i32 + vib).max(1) as u16
            };

            let base = if legacy && t == 0 && channel.arp_x == 0 && channel.arp_y == 0 {
                channel.period
            } else {
                effective_period
            };

            channel.frequency = crate::tracker::frequency(base);
        }
    }

    // -- mixing ---------------------------------------------------------

    fn mix_frame(&mut self) -> (i16, i16) {
        let mut left = 0.0f32;
        let mut right = 0.0f32;
        let channel_count = self.channels.len().max(1) as f32;
        let interpolate = self.interpolate;
        let amplify = self.amplify;
        let play_mode = self.play_mode;
        let only = self.channel_only;

        for idx in 0..self.channels.len() {
            if let Some(only_idx) = only {
                if idx != only_idx {
                    continue;
                }
            }

            let sample_idx = self.channels[idx].sample_index;
            let sample = &self.module.samples[sample_idx];
            let length = sample.length as usize;
            let loop_start = sample.loop_start as usize;
            let loop_length = sample.loop_length as usize;
            let is_looping = sample.is_looping();
            let bytes_start = sample.offset;

            let channel = &mut self.channels[idx];

            let tremolo_offset = if channel.tremolo.speed > 0 { channel.tremolo.value(&mut self.rng) } else { 0 };
            let effective_volume = (channel.volume as i32 + tremolo_offset).clamp(0, 64) as f32 / 64.0;

            let bytes = &self.module.bytes[bytes_start..bytes_start + length.max(0).min(self.module.bytes.len().saturating_sub(bytes_start))];
            let dry = mixer::read_sample(bytes, channel.sample_position, length, interpolate) * effective_volume;

            let frame = mixer::render_channel_frame(channel, dry, play_mode, idx);
            let gain = amplify / channel_count;
            left += frame.left * gain;
            right += frame.right * gain;

            advance_sample_position(channel, length, loop_start, loop_length, is_looping, self.sample_rate);
        }

        left *= 32_767.0;
        right *= 32_767.0;

        if play_mode.is_filtered() {
            let (fl, fr) = self.global_filter.apply(left, right);
            left = fl;
            right = fr;
        }

        (mixer::clamp_i16(left), mixer::clamp_i16(right))
    }

    fn advance_position(&mut self) {
        let mut loop_target: Option<usize> = None;
        for channel in self.channels.iter_mut() {
            if channel.request_loop {
                if loop_target.is_none() {
                    loop_target = channel.loop_row;
                }
                channel.request_loop = false;
            }
        }
        if let Some(target_row) = loop_target {
            self.row_index = target_row;
            self.next_order = None;
            self.next_row = None;
            return;
        }

        let natural_next_order = (self.order_index + 1) as u8;
        let explicit_order = self.next_order.take();
        let target_order_raw = explicit_order.unwrap_or(natural_next_order);
        let explicit_row = self.next_row.take();
        // A `Dxy` row break coincident with an `EE` pattern delay on the
        // same row lands one row later than the break's own target in
        // legacy mode (documented quirk, spec §4.4.8).
        let target_row = if self.legacy && self.pattern_delay_this_row {
            explicit_row.map(|r| r as usize + 1).unwrap_or(0)
        } else {
            explicit_row.unwrap_or(0) as usize
        };

        let wrapped = target_order_raw as usize >= self.effective_end;
        let final_order = if wrapped {
            self.effective_start
        } else {
            target_order_raw as usize
        };

        // A `Bxx` targeting the order it's already on is only a loop once
        // that (order, row) destination has actually been visited before —
        // not on first encounter (spec §9, Open Question (a)).
        let is_loop = wrapped || self.visited.contains(&(final_order, target_row));

        if is_loop {
            self.loops_completed += 1;
            self.visited.clear();
            if self.loops_completed >= self.max_loops {
                self.finished = true;
            }
        }
        self.visited.insert((final_order, target_row));
        self.order_index = final_order;
        self.row_index = target_row.min(63);
    }

    pub fn module(&self) -> &Module {
        &self.module
    }
}

fn trigger_sample(channel: &mut ChannelState, module: &Module, row_period: u16, finetuned_period: u16) {
    let sample = &module.samples[channel.sample_index];
    channel.period = finetuned_period;
    // Raw cell period, not the finetuned one: `arpeggio_period` looks this
    // up in the finetune-0 row and applies the channel's finetune only to
    // the shifted note (spec §4.4.6).
    channel.row_period = row_period;
    channel.sample_position = if channel.reverse {
        (sample.length.saturating_sub(1)) as f64
    } else {
        0.0
    };
    channel.playing = true;
    channel.arp_counter = 0;
    // `E4x`/`E7x` bit 2 controls whether a new note resets the oscillator's
    // phase; when clear the waveform runs continuously across notes.
    if channel.vibrato.retrigger_on_note {
        channel.vibrato.reset();
    }
    if channel.tremolo.retrigger_on_note {
        channel.tremolo.reset();
    }
}

fn apply_delayed_trigger(channel: &mut ChannelState, module: &Module, legacy: bool) {
    if let Some(sample_idx) = channel.pending_sample.take() {
        channel.sample_index = sample_idx;
    }
    if let Some(volume) = channel.pending_volume.take() {
        channel.set_volume(volume);
    }
    let row_period = channel.pending_row_period.take();
    if let Some(period) = channel.pending_period.take() {
        let sample = &module.samples[channel.sample_index];
        channel.period = period;
        channel.row_period = row_period.unwrap_or(period);
        if !(legacy && sample.is_looping()) {
            channel.sample_position = 0.0;
        }
        channel.playing = true;
    }
    if let Some(offset) = channel.pending_offset.take() {
        let length = module.samples[channel.sample_index].length as u32;
        channel.sample_position = (offset * 256).min(length) as f64;
    }
}

fn advance_funk(channel: &mut ChannelState, module: &mut Module) {
    let sample_idx = channel.sample_index;
    let (loop_start, loop_length) = {
        let sample = &module.samples[sample_idx];
        (sample.offset + sample.loop_start as usize, sample.loop_length as usize)
    };
    if loop_length == 0 {
        return;
    }
    let pos = loop_start + (channel.funk_accum as usize % loop_length);
    module.invert_sample_byte(pos);
}

fn advance_sample_position(
    channel: &mut ChannelState,
    length: usize,
    loop_start: usize,
    loop_length: usize,
    is_looping: bool,
    sample_rate: u32,
) {
    if !channel.playing || channel.frequency <= 0.0 {
        return;
    }
    let step = channel.frequency / sample_rate as f64;
    if channel.reverse {
        channel.sample_position -= step;
        if channel.sample_position < 0.0 {
            if is_looping {
                channel.sample_position += loop_length as f64;
            } else {
                channel.playing = false;
                channel.sample_position = 0.0;
            }
        }
        return;
    }

    channel.sample_position += step;
    let loop_end = (loop_start + loop_length) as f64;
    if is_looping {
        // A cued sample on a `loop_start == 0` source defers past the
        // ordinary loop wrap and only takes over once the current sample
        // has played all the way to its true end (spec §4.4.8).
        let boundary = if channel.full_sample_then_loop && channel.cued_sample.is_some() {
            length as f64
        } else {
            loop_end
        };
        if channel.sample_position >= boundary {
            if let Some(cued) = channel.cued_sample.take() {
                channel.sample_index = cued;
                channel.full_sample_then_loop = false;
                channel.sample_position -= boundary;
            } else {
                channel.sample_position -= loop_length as f64;
            }
        }
    } else if channel.sample_position >= length as f64 {
        channel.playing = false;
        channel.sample_position = length as f64;
    }
}

fn advance_tone_portamento(channel: &mut ChannelState) {
    if channel.period < channel.tone_period {
        channel.period = channel.period.saturating_add(channel.tone_memory).min(channel.tone_period);
    } else if channel.period > channel.tone_period {
        channel.period = channel.period.saturating_sub(channel.tone_memory).max(channel.tone_period);
    }
}

/// Arpeggio note lookup: shifts the row's base note by `semitones`, rolling
/// into the next finetune index when the shift runs past the table's end
/// (spec §4.4.6).
fn arpeggio_period(table: &PeriodTable, row_period: u16, finetune: u8, semitones: u8) -> (u16, u8) {
    let Some(note_index) = table.note_of(row_period) else {
        return (row_period, finetune);
    };
    let row_len = table.row_len();
    let mut idx = note_index + semitones as usize;
    let mut ft = finetune;
    if idx >= row_len {
        idx -= row_len;
        ft = (ft + 1) % 16;
    }
    (table.period_at(ft, idx), ft)
}

trait ResultExt {
    fn clone_err(&self) -> Result<(), ModError>;
}

impl ResultExt for Result<(), ModError> {
    fn clone_err(&self) -> Result<(), ModError> {
        match self {
            Ok(()) => Ok(()),
            Err(e) => Err(ModError::invalid_module(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arpeggio_period_rolls_finetune_on_overflow() {
        let table = PeriodTable::select(TableKind::Legacy);
        let (period, finetune) = arpeggio_period(&table, 856, 0, 40);
        assert!(period > 0 || finetune != 0);
    }

    #[test]
    fn tone_portamento_snaps_on_overshoot() {
        let mut channel = ChannelState::new();
        channel.period = 400;
        channel.tone_period = 404;
        channel.tone_memory = 10;
        advance_tone_portamento(&mut channel);
        assert_eq!(channel.period, 404);
    }

    #[test]
    fn non_looping_sample_stops_at_end() {
        let mut channel = ChannelState::new();
        channel.playing = true;
        channel.frequency = 8363.0;
        channel.sample_position = 9.0;
        advance_sample_position(&mut channel, 10, 0, 0, false, 8363);
        assert!(!channel.playing);
    }

    #[test]
    fn looping_sample_wraps_by_subtraction() {
        let mut channel = ChannelState::new();
        channel.playing = true;
        channel.frequency = 8363.0;
        channel.sample_position = 99.5;
        advance_sample_position(&mut channel, 100, 0, 100, true, 8363);
        assert!(channel.sample_position < 100.0);
    }
}
