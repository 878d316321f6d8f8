//! Command dispatch
//!
//! Each decoded command maps to one handler; a handler returns the
//! response payload for the output framer, or `None` when the command
//! produces no data (in which case nothing is sent back at all).

use chrono::{Datelike, TimeZone, Timelike, Utc};
use tracing::{debug, info, warn};

use board_hal::{reg, Clock, ControlRegisters, Dac, I2cBus, RealTimeClock, TofChip};
use command_channel::Command;
use detector_link::{Expected, ECHO_LESS};
use error_log::FaultCode;
use event_builder::serialize_detector_only;
use tof_correlator::{TofSample, RING_CAPACITY};

use crate::pipeline::{OutputMode, Pipeline};
use crate::FIRMWARE_VERSION;

/// I2C addresses of the configuration and monitoring devices.
mod device {
    /// External 12-bit threshold DAC on channel 5.
    pub const DAC_CH5: u8 = 0x0E;
    /// Timing-discriminator DACs.
    pub const TOF_DAC: [u8; 2] = [0x0C, 0x0F];
    /// Board temperature sensor.
    pub const TMP100: u8 = 0x48;
    /// Temperature register.
    pub const TMP100_TEMP_REG: u8 = 0x00;
    /// External real-time clock.
    pub const RTC: u8 = 0x6F;
    /// Barometer.
    pub const BAROMETER: u8 = 0x70;
    /// Power-monitor shunt voltage register.
    pub const INA_SHUNT_REG: u8 = 0x01;
    /// Power-monitor bus voltage register.
    pub const INA_BUS_REG: u8 = 0x02;
}

/// Detector-internal command codes never forwarded by passthrough.
const DETECTOR_INTERNAL: [u8; 2] = [0x52, 0x53];

/// Detector trigger-enable code sent at run start.
const DETECTOR_TRIGGER_ENABLE: u8 = 0x65;

/// Samples per channel the bulk timing readout returns at most.
const TOF_READOUT_MAX: usize = 21;

pub(crate) fn dispatch(p: &mut Pipeline, command: &Command) -> Option<Vec<u8>> {
    match command {
        Command::SetThreshold { channel, value } => set_threshold(p, *channel, *value),
        Command::GetThreshold { channel } => get_threshold(p, *channel),
        Command::ReadErrors => Some(read_errors(p)),
        Command::SetTofDac { channel, value } => set_tof_dac(p, *channel, *value),
        Command::GetTofDac { channel } => get_tof_dac(p, *channel),
        Command::SetLed { on } => {
            p.io.registers.update(reg::LED, reg::LED_TRIGGER, *on);
            None
        }
        Command::GetVersion => Some(vec![FIRMWARE_VERSION]),
        Command::TofReset => {
            p.io.tof_chip.reset();
            None
        }
        Command::TofConfigWrite { index, value } => {
            if let Some(slot) = p.tof_config.get_mut(usize::from(*index)) {
                *slot = *value;
                p.io.tof_chip.write_config(&p.tof_config);
            }
            None
        }
        Command::TofConfigRead => Some(p.io.tof_chip.read_config().to_vec()),
        Command::DetectorCommand { fpga, code, data } => detector_command(p, *fpga, *code, data),
        Command::ReadBusVoltage { device } => {
            Some(i2c_read(p, *device, device::INA_BUS_REG, 2))
        }
        Command::ReadCurrent { device } => {
            Some(i2c_read(p, *device, device::INA_SHUNT_REG, 2))
        }
        Command::ReadTemperature => {
            Some(i2c_read(p, device::TMP100, device::TMP100_TEMP_REG, 2))
        }
        Command::RtcRegRead { reg } => Some(i2c_read(p, device::RTC, *reg, 1)),
        Command::RtcRegWrite { reg, value } => {
            i2c_write(p, device::RTC, *reg, *value);
            None
        }
        Command::BaroRead { reg } => Some(i2c_read(p, device::BAROMETER, *reg, 1)),
        Command::BaroWrite { reg, value } => {
            i2c_write(p, device::BAROMETER, *reg, *value);
            None
        }
        Command::SetOutputMode { mode } => {
            match mode {
                0 => p.output_mode = OutputMode::Sync,
                1 => p.output_mode = OutputMode::Host,
                other => debug!(other, "unknown output mode ignored"),
            }
            None
        }
        Command::ReinitSyncLink => {
            p.io.sync.reinit();
            None
        }
        Command::TofStreamOn => {
            p.tof_stream = true;
            p.tof_a.set_streaming(true);
            p.tof_b.set_streaming(true);
            None
        }
        Command::TofStreamOff => {
            p.tof_stream = false;
            p.tof_a.set_streaming(false);
            p.tof_b.set_streaming(false);
            None
        }
        Command::ReadSavedSingles { channel } => {
            let (count, hardware) = p.singles.saved(usize::from(*channel));
            Some(vec![(count >> 8) as u8, count as u8, hardware])
        }
        Command::ReadSingles { channel } => {
            let (count, hardware) = p.singles.live(usize::from(*channel));
            Some(vec![(count >> 8) as u8, count as u8, hardware])
        }
        Command::TofFillCounts => Some(vec![p.tof_a.write_ptr(), p.tof_b.write_ptr()]),
        Command::TofLatest { channel } => Some(tof_latest(p, *channel)),
        Command::TofReadAll => Some(tof_read_all(p)),
        Command::SetTriggerMask { which, mask } => {
            if let Some(addr) = mask_register(*which) {
                p.io.registers.write(addr, mask & 0x0F);
            }
            None
        }
        Command::GetTriggerMask { which } => {
            let value = mask_register(*which).map_or(0, |addr| p.io.registers.read(addr));
            Some(vec![value])
        }
        Command::LogicReset => {
            let now = p.io.clock.now();
            let out = vec![(now >> 16) as u8, (now >> 8) as u8, now as u8];
            p.logic_reset();
            Some(out)
        }
        Command::SetPrescale { which, value } => {
            let addr = match which {
                1 => Some(reg::PRESCALE_1),
                2 => Some(reg::PRESCALE_2),
                _ => None,
            };
            if let Some(addr) = addr {
                p.io.registers.write(addr, *value);
            }
            None
        }
        Command::SetCoincidenceWindow { value } => {
            for i in 0..reg::WINDOW_COUNT {
                p.io.registers.write(reg::WINDOW_BASE + i, *value);
            }
            None
        }
        Command::TriggerEnable { value } => {
            match value {
                1 => p.arbiter.set_enabled(true),
                0 => p.arbiter.set_enabled(false),
                _ => {}
            }
            None
        }
        Command::StartRun { run, read_detector } => start_run(p, *run, *read_detector),
        Command::TriggerStatus => Some(vec![u8::from(p.arbiter.is_enabled())]),
        Command::EndRun => Some(end_run(p)),
        Command::LoadAsicMask {
            fpga,
            chip,
            kind,
            fill,
            clusters,
        } => load_asic_mask(p, *fpga, *chip, *kind, *fill, clusters),
        Command::CalibrationStrobe { fpga, delay, tag } => {
            let packed = ((delay & 0x3F) << 2) | tag;
            let _ = p.link.write_command(0, 0x02, &[0x1F, packed, *fpga], 0x42);
            Some(p.link.read_trigger_primitives(*fpga))
        }
        Command::CalibrationRead { tag } => {
            let _ = p.link.request_calibration_event(*tag);
            let record = serialize_detector_only(p.link.event(), p.link.arena(), &p.log);
            p.link.clear_cycle();
            Some(record)
        }
        Command::RtcSet { raw } => {
            rtc_set(p, raw);
            None
        }
        Command::RtcGet => Some(rtc_get(p)),
        Command::DetectorLogicReset => {
            p.link.reset_all_logic();
            None
        }
        Command::CalibrateTiming { board } => {
            if *board > 7 {
                p.link.calibrate_all();
            } else {
                p.link.calibrate_timing(*board);
            }
            None
        }
        Command::Unknown { opcode } => {
            debug!(opcode, "unknown command ignored");
            None
        }
    }
}

fn set_threshold(p: &mut Pipeline, channel: u8, value: u16) -> Option<Vec<u8>> {
    match channel {
        // The on-board DACs take the single setting byte.
        1..=4 => {
            let setting = (value >> 8) as u8;
            if p.io.dac.load(channel, u16::from(setting)).is_err() {
                p.log.record(FaultCode::DacLoad, 1, channel);
            } else {
                p.thresholds[usize::from(channel) - 1] = setting;
            }
        }
        5 => {
            if p.io.dac.load(device::DAC_CH5, value).is_err() {
                p.log.record(FaultCode::DacLoad, 1, device::DAC_CH5);
            }
        }
        _ => {}
    }
    None
}

fn get_threshold(p: &mut Pipeline, channel: u8) -> Option<Vec<u8>> {
    match channel {
        5 => match p.io.dac.read(device::DAC_CH5) {
            Ok(value) => Some(value.to_be_bytes().to_vec()),
            Err(_) => {
                p.log.record(FaultCode::DacRead, 1, device::DAC_CH5);
                Some(vec![0, 0])
            }
        },
        1..=4 => Some(vec![p.thresholds[usize::from(channel) - 1]]),
        _ => Some(vec![0]),
    }
}

fn read_errors(p: &mut Pipeline) -> Vec<u8> {
    let records = p.log.drain();
    if records.is_empty() {
        return vec![0x00, 0xEE, 0xFF];
    }
    let mut out = Vec::with_capacity(records.len() * 3);
    for record in records {
        out.push(record.code as u8);
        out.push(record.value0);
        out.push(record.value1);
    }
    out
}

fn tof_dac_address(channel: u8) -> Option<u8> {
    match channel {
        1 => Some(device::TOF_DAC[0]),
        2 => Some(device::TOF_DAC[1]),
        _ => None,
    }
}

fn set_tof_dac(p: &mut Pipeline, channel: u8, value: u16) -> Option<Vec<u8>> {
    let address = tof_dac_address(channel)?;
    if p.io.dac.load(address, value).is_err() {
        p.log.record(FaultCode::TofDacLoad, 1, address);
    }
    None
}

fn get_tof_dac(p: &mut Pipeline, channel: u8) -> Option<Vec<u8>> {
    let address = tof_dac_address(channel)?;
    match p.io.dac.read(address) {
        Ok(value) => Some(value.to_be_bytes().to_vec()),
        Err(_) => {
            p.log.record(FaultCode::TofDacRead, 1, address);
            Some(vec![0, 0])
        }
    }
}

fn i2c_read(p: &mut Pipeline, device: u8, register: u8, count: usize) -> Vec<u8> {
    let mut buf = vec![0u8; count];
    if let Err(err) = p.io.i2c.read_reg(device, register, &mut buf) {
        warn!(device, register, %err, "I2C read failed");
    }
    buf
}

fn i2c_write(p: &mut Pipeline, device: u8, register: u8, value: u8) {
    if let Err(err) = p.io.i2c.write_reg(device, register, value) {
        warn!(device, register, %err, "I2C write failed");
    }
}

fn mask_register(which: u8) -> Option<u8> {
    match which {
        1 => Some(reg::TRIGGER_MASK_1),
        2 => Some(reg::TRIGGER_MASK_2),
        _ => None,
    }
}

fn detector_command(p: &mut Pipeline, fpga: u8, code: u8, data: &[u8]) -> Option<Vec<u8>> {
    if DETECTOR_INTERNAL.contains(&code) {
        return None;
    }
    p.io.registers.update(reg::LED, reg::LED_DETECTOR, true);
    // The layer-count command also sets how many boards this side reads.
    if code == 0x0F {
        if let Some(&count) = data.first() {
            p.link.set_board_count(count);
        }
    }
    let sent = p.link.write_command(fpga, code, data, 0x10);
    let response = if !sent || ECHO_LESS.contains(&code) {
        None
    } else if (0x20..=0x25).contains(&code) {
        Some(p.link.read_register_block())
    } else if code == 0x46 {
        Some(p.link.read_i2c_block())
    } else {
        let outcome = p.link.read_packet(Expected::Any);
        if !outcome.is_ok() {
            p.log
                .record(FaultCode::DetectorReadFailed, outcome.code, 0x10);
        }
        (!outcome.payload.is_empty()).then_some(outcome.payload)
    };
    p.io.registers.update(reg::LED, reg::LED_DETECTOR, false);
    response
}

fn tof_sample_bytes(out: &mut Vec<u8>, sample: &TofSample) {
    out.extend_from_slice(&sample.reference().to_be_bytes());
    out.extend_from_slice(&sample.stop().to_be_bytes());
    out.extend_from_slice(&sample.tag.to_be_bytes());
}

fn back_index(ptr: u8) -> u8 {
    (usize::from(ptr) + RING_CAPACITY - 1) as u8 % RING_CAPACITY as u8
}

fn tof_latest(p: &mut Pipeline, channel: u8) -> Vec<u8> {
    let mut out = vec![0u8; 9];
    let fill = |out: &mut Vec<u8>, sample: &TofSample, ptr: u8| {
        out[0..2].copy_from_slice(&sample.reference().to_be_bytes());
        out[2] = 0;
        out[3..5].copy_from_slice(&sample.stop().to_be_bytes());
        out[5] = 0;
        out[6..8].copy_from_slice(&sample.tag.to_be_bytes());
        out[8] = ptr;
    };
    if channel == 0 {
        let (sample, ptr) = p.tof_a.latest();
        match sample {
            Some(sample) => {
                fill(&mut out, &sample, ptr);
                p.tof_a.clear();
            }
            None => out[8] = back_index(ptr),
        }
    } else {
        let (sample, ptr) = p.tof_b.latest();
        match sample {
            Some(sample) => {
                fill(&mut out, &sample, ptr);
                p.tof_b.clear();
            }
            None => {
                out[8] = back_index(ptr);
                p.tof_a.clear();
                p.tof_b.clear();
            }
        }
    }
    out
}

fn tof_read_all(p: &mut Pipeline) -> Vec<u8> {
    let (total_a, samples_a) = p.tof_a.take_recent(TOF_READOUT_MAX);
    let (total_b, samples_b) = p.tof_b.take_recent(TOF_READOUT_MAX);
    let clamped =
        usize::from(total_a) > TOF_READOUT_MAX || usize::from(total_b) > TOF_READOUT_MAX;
    let mut out = vec![
        samples_a.len() as u8,
        samples_b.len() as u8,
        if clamped { 2 } else { 1 },
    ];
    for sample in samples_a.iter().chain(samples_b.iter()) {
        tof_sample_bytes(&mut out, sample);
    }
    out
}

fn start_run(p: &mut Pipeline, run: u16, read_detector: bool) -> Option<Vec<u8>> {
    p.tof_a.clear();
    p.tof_b.clear();
    p.io.clock.reset();
    p.singles.reset();
    p.run_number = run;
    p.read_detector = read_detector;
    p.arbiter.reset_counts();
    p.arbiter.set_enabled(true);
    p.io.registers.write(reg::PULSE, reg::PULSE_CNTR_RST);
    if read_detector {
        let _ = p.link.write_command(0, DETECTOR_TRIGGER_ENABLE, &[], 0xFF);
        let outcome = p.link.read_packet(Expected::Echo);
        if !outcome.is_ok() {
            p.log.record(
                FaultCode::DetectorTriggerEnable,
                outcome.payload.get(2).copied().unwrap_or(0),
                outcome.code,
            );
        }
    }
    info!(run, read_detector, "run started");
    None
}

fn end_run(p: &mut Pipeline) -> Vec<u8> {
    p.arbiter.discard_latched();
    p.arbiter.set_enabled(false);
    let mut out = p.arbiter.raw_count().to_be_bytes().to_vec();
    out.extend_from_slice(&p.arbiter.accepted_count().to_be_bytes());
    info!(
        raw = p.arbiter.raw_count(),
        accepted = p.arbiter.accepted_count(),
        "run ended"
    );
    out
}

/// Build the 64-bit channel mask from (width, position) clusters.
fn build_mask(clusters: &[(u8, u8)], fill: bool) -> u64 {
    let mut mask = 0u64;
    for &(width, position) in clusters {
        let width = u32::from(width).max(1);
        let ones = if width >= 64 {
            u64::MAX
        } else {
            (1u64 << width) - 1
        };
        let shift = 64i32 - width as i32 - i32::from(position);
        if (0..64).contains(&shift) {
            mask |= ones << shift;
        }
    }
    if fill {
        !mask
    } else {
        mask
    }
}

fn load_asic_mask(
    p: &mut Pipeline,
    fpga: u8,
    chip: u8,
    kind: u8,
    fill: bool,
    clusters: &[(u8, u8)],
) -> Option<Vec<u8>> {
    let mask = build_mask(clusters, fill);
    let code = match kind {
        1 => 0x15, // calibration mask
        2 => 0x13, // data mask
        _ => 0x14, // trigger mask
    };
    p.io.registers.update(reg::LED, reg::LED_DETECTOR, true);
    let mut data = vec![chip];
    data.extend_from_slice(&mask.to_be_bytes());
    if p.link.write_command(fpga, code, &data, 0x41) {
        let outcome = p.link.read_packet(Expected::Echo);
        if !outcome.is_ok() {
            p.log
                .record(FaultCode::DetectorReadFailed, outcome.code, code);
        }
    }
    p.io.registers.update(reg::LED, reg::LED_DETECTOR, false);
    None
}

fn rtc_set(p: &mut Pipeline, raw: &[u8; 10]) {
    let year = i32::from(raw[8]) * 256 + i32::from(raw[9]);
    let parsed = Utc
        .with_ymd_and_hms(
            year,
            u32::from(raw[7]),
            u32::from(raw[4]),
            u32::from(raw[2]),
            u32::from(raw[1]),
            u32::from(raw[0]),
        )
        .single();
    match parsed {
        Some(value) => p.io.rtc.write(value),
        None => warn!(year, "invalid RTC set ignored"),
    }
}

fn rtc_get(p: &mut Pipeline) -> Vec<u8> {
    let now = p.io.rtc.read();
    let day_of_year = now.ordinal() as u16;
    let year = now.year() as u16;
    vec![
        now.second() as u8,
        now.minute() as u8,
        now.hour() as u8,
        now.weekday().number_from_sunday() as u8,
        now.day() as u8,
        (day_of_year / 256) as u8,
        (day_of_year % 256) as u8,
        now.month() as u8,
        (year / 256) as u8,
        (year % 256) as u8,
    ]
}
