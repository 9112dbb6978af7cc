#![cfg(feature = "std")]

use optiboot::{
    BootConfig, Command, DeviceParams, Halt, ResetCause, boot,
    config::TransportKind,
    device::ChipDB,
    format::Firmware,
    hal::WatchdogTimeout,
    host::{Programmer, reassemble},
    protocol::MemoryType,
    sim::{LoopbackRadio, ScriptedUart, SimEeprom, SimulatedMcu, SpmOp, Trace, TraceEvent},
    transport::{RadioLink, SerialChannel},
};
use pretty_assertions::assert_eq;

const M328P: DeviceParams = DeviceParams::ATMEGA328P;

fn raw(cmds: &[Command]) -> Vec<u8> {
    cmds.iter()
        .flat_map(|c| c.clone().into_raw().unwrap())
        .collect()
}

fn run_serial(
    mcu: &mut SimulatedMcu,
    eeprom: &mut SimEeprom,
    config: &BootConfig,
    script: &[u8],
) -> (Halt, Vec<u8>) {
    let params = *mcu.params();
    let mut chan = SerialChannel::new(ScriptedUart::from_bytes(script));
    let halt = boot(mcu, &mut chan, eeprom, params, config);
    (halt, chan.into_inner().take_output())
}

fn run(mcu: &mut SimulatedMcu, script: &[u8]) -> (Halt, Vec<u8>) {
    let mut eeprom = SimEeprom::new(1024);
    run_serial(mcu, &mut eeprom, &BootConfig::default(), script)
}

#[test]
fn sync_and_version_parameters() {
    let mut mcu = SimulatedMcu::new(M328P);
    let script = raw(&[
        Command::GetSync,
        Command::get_parameter(0x81),
        Command::get_parameter(0x82),
        Command::get_parameter(0x98),
    ]);
    let (halt, out) = run(&mut mcu, &script);
    assert_eq!(
        out,
        vec![0x14, 0x10, 0x14, 5, 0x10, 0x14, 0, 0x10, 0x14, 0x03, 0x10]
    );
    // no more input: the session watchdog fires
    assert_eq!(halt, Halt::WatchdogReset);
    assert!(!mcu.marker().is_armed());
}

#[test]
fn signature_and_ignored_commands() {
    let mut mcu = SimulatedMcu::new(M328P);
    let script = raw(&[
        Command::ReadSign,
        Command::SetDevice { params: [0x86; 20] },
        Command::SetDeviceExt { params: [1; 5] },
        Command::Universal {
            instruction: [0xac, 0x53, 0, 0],
        },
        Command::EnterProgmode,
    ]);
    let (_, out) = run(&mut mcu, &script);
    assert_eq!(
        out,
        vec![
            0x14, 0x1e, 0x95, 0x0f, 0x10, // READ_SIGN
            0x14, 0x10, // SET_DEVICE
            0x14, 0x10, // SET_DEVICE_EXT
            0x14, 0x00, 0x10, // UNIVERSAL
            0x14, 0x10, // ENTER_PROGMODE
        ]
    );
}

#[test]
fn signature_ignores_current_address() {
    let mut mcu = SimulatedMcu::new(M328P);
    mcu.load_flash(0x200, &[9; 4]).unwrap();
    let script = raw(&[
        Command::load_address(0x200),
        Command::ReadSign,
        Command::read_flash(4),
        Command::ReadSign,
    ]);
    let (_, out) = run(&mut mcu, &script);
    let sign = [0x14, 0x1e, 0x95, 0x0f, 0x10];
    assert_eq!(&out[..2], &[0x14, 0x10]);
    assert_eq!(&out[2..7], &sign);
    assert_eq!(&out[7..13], &[0x14, 9, 9, 9, 9, 0x10]);
    assert_eq!(&out[13..], &sign);
}

#[test]
fn second_load_address_wins() {
    let mut mcu = SimulatedMcu::new(M328P);
    mcu.load_flash(0x100, &[0xd0, 0xd1, 0xd2, 0xd3]).unwrap();
    let script = raw(&[
        Command::load_address(0x40),
        Command::load_address(0x100),
        Command::read_flash(4),
    ]);
    let (_, out) = run(&mut mcu, &script);
    assert_eq!(
        out,
        vec![0x14, 0x10, 0x14, 0x10, 0x14, 0xd0, 0xd1, 0xd2, 0xd3, 0x10]
    );
}

#[test]
fn read_page_advances_address() {
    let mut mcu = SimulatedMcu::new(M328P);
    mcu.load_flash(0, &[1, 2, 3, 4]).unwrap();
    let script = raw(&[
        Command::load_address(0),
        Command::read_flash(2),
        Command::read_flash(2),
    ]);
    let (_, out) = run(&mut mcu, &script);
    assert_eq!(&out[2..], &[0x14, 1, 2, 0x10, 0x14, 3, 4, 0x10]);
}

#[test]
fn programmed_page_reads_back() {
    let mut mcu = SimulatedMcu::new(M328P);
    let page: Vec<u8> = (0..128u32).map(|i| (i * 7) as u8).collect();
    let script = raw(&[
        Command::load_address(0x100),
        Command::prog_flash(page.clone()),
        Command::load_address(0x100),
        Command::read_flash(128),
    ]);
    let (_, out) = run(&mut mcu, &script);
    assert_eq!(&out[..6], &[0x14, 0x10, 0x14, 0x10, 0x14, 0x10]);
    assert_eq!(&out[7..7 + 128], &page[..]);
    assert_eq!(&mcu.flash()[0x100..0x180], &page[..]);
}

#[test]
fn short_page_is_padded_from_page_buffer() {
    let mut mcu = SimulatedMcu::new(M328P);
    let script = raw(&[Command::load_address(0), Command::prog_flash(vec![0x12, 0x34])]);
    run(&mut mcu, &script);
    assert_eq!(&mcu.flash()[..2], &[0x12, 0x34]);
    // one full page is always written
    let writes = mcu
        .journal()
        .iter()
        .filter(|op| matches!(op, SpmOp::Fill(..)))
        .count();
    assert_eq!(writes, 64);
}

#[test]
fn bad_terminator_gets_no_reply_and_resets() {
    let mut mcu = SimulatedMcu::new(M328P);
    let (halt, out) = run(&mut mcu, &[0x30, 0x21]);
    assert!(out.is_empty());
    assert_eq!(halt, Halt::WatchdogReset);
    // forced within the shortest watchdog period, not the session timeout
    assert!(mcu.watchdog().now_us() < 100_000);
    assert!(!mcu.marker().is_armed());

    // marker was cleared: the watchdog reset comes back to the bootloader
    let (halt, out) = run(&mut mcu, &raw(&[Command::GetSync]));
    assert_eq!(out, vec![0x14, 0x10]);
    assert_eq!(halt, Halt::WatchdogReset);
    assert_eq!(mcu.app_starts(), 0);
}

#[test]
fn bad_terminator_skips_nrww_erase() {
    let mut mcu = SimulatedMcu::new(M328P);
    mcu.load_flash(0x7000, &[0xab; 128]).unwrap();
    let mut script = raw(&[Command::load_address(0x7000)]);
    let mut prog = Command::prog_flash(vec![0; 128]).into_raw().unwrap();
    *prog.last_mut().unwrap() = 0x00;
    script.extend(prog);

    let (halt, out) = run(&mut mcu, &script);
    assert_eq!(out, vec![0x14, 0x10]);
    assert_eq!(halt, Halt::WatchdogReset);
    assert!(mcu.journal().is_empty());
    assert_eq!(&mcu.flash()[0x7000..0x7080], &[0xab; 128][..]);
}

fn traced_session(address: u32) -> Vec<TraceEvent> {
    let trace = Trace::default();
    let mut mcu = SimulatedMcu::new(M328P).with_trace(trace.clone());
    let script = raw(&[
        Command::load_address(address),
        Command::prog_flash(vec![0x11; 128]),
    ]);
    let mut chan = SerialChannel::new(ScriptedUart::from_bytes(&script).with_trace(trace.clone()));
    let mut eeprom = SimEeprom::new(1024);
    boot(&mut mcu, &mut chan, &mut eeprom, M328P, &BootConfig::default());
    trace.take()
}

#[test]
fn rww_page_erase_starts_before_data_arrives() {
    let trace = traced_session(0x100);
    let type_byte = trace
        .iter()
        .position(|e| *e == TraceEvent::Rx(b'F'))
        .unwrap();
    assert_eq!(trace[type_byte + 1], TraceEvent::Spm(SpmOp::Erase(0x100)));
    assert_eq!(trace[type_byte + 2], TraceEvent::Rx(0x11));
}

#[test]
fn nrww_page_erase_waits_for_terminator() {
    let trace = traced_session(0x7000);
    let last_rx = trace
        .iter()
        .rposition(|e| matches!(e, TraceEvent::Rx(_)))
        .unwrap();
    let first_spm = trace
        .iter()
        .position(|e| matches!(e, TraceEvent::Spm(_)))
        .unwrap();
    assert_eq!(trace[last_rx], TraceEvent::Rx(0x20));
    assert_eq!(first_spm, last_rx + 1);
    assert_eq!(trace[first_spm], TraceEvent::Spm(SpmOp::Erase(0x7000)));
}

#[test]
fn write_beyond_flash_is_ignored() {
    let mut mcu = SimulatedMcu::new(M328P);
    let script = raw(&[
        Command::load_address(0x8000),
        Command::prog_flash(vec![0; 128]),
    ]);
    let (_, out) = run(&mut mcu, &script);
    assert_eq!(out, vec![0x14, 0x10, 0x14, 0x10]);
    assert!(mcu.journal().is_empty());
}

#[test]
fn idle_bootloader_falls_through_to_application() {
    let mut mcu = SimulatedMcu::new(M328P);
    let (halt, out) = run(&mut mcu, &[]);
    assert!(out.is_empty());
    assert_eq!(halt, Halt::WatchdogReset);
    assert!(mcu.marker().is_armed());
    // roughly the configured session timeout went by
    assert!(mcu.watchdog().now_us() >= 2_000_000);

    let (halt, _) = run(&mut mcu, &[]);
    assert_eq!(halt, Halt::StartApplication(ResetCause::POWER_ON));
    assert_eq!(mcu.handoff(), Some(ResetCause::POWER_ON));
    assert_eq!(mcu.app_starts(), 1);
    assert!(!mcu.marker().is_armed());
}

#[test]
fn leave_progmode_resets_quickly_into_application() {
    let mut mcu = SimulatedMcu::new(M328P);
    mcu.external_reset();
    let script = raw(&[Command::GetSync, Command::LeaveProgmode]);
    let (halt, out) = run(&mut mcu, &script);
    assert_eq!(out, vec![0x14, 0x10, 0x14, 0x10]);
    assert_eq!(halt, Halt::WatchdogReset);
    assert!(mcu.watchdog().now_us() < 100_000);
    assert!(mcu.marker().is_armed());

    let (halt, _) = run(&mut mcu, &[]);
    assert_eq!(
        halt,
        Halt::StartApplication(ResetCause::POWER_ON.union(ResetCause::EXTERNAL))
    );
}

#[test]
fn non_entry_cause_starts_application_directly() {
    let config = BootConfig {
        entry_causes: ResetCause::EXTERNAL,
        ..BootConfig::default()
    };
    let mut mcu = SimulatedMcu::new(M328P);
    let mut eeprom = SimEeprom::new(1024);
    let script = raw(&[Command::GetSync]);

    let (halt, out) = run_serial(&mut mcu, &mut eeprom, &config, &script);
    assert_eq!(halt, Halt::StartApplication(ResetCause::POWER_ON));
    assert!(out.is_empty());
    assert!(!mcu.marker().is_armed());

    mcu.external_reset();
    let (halt, out) = run_serial(&mut mcu, &mut eeprom, &config, &script);
    assert_eq!(out, vec![0x14, 0x10]);
    assert_eq!(halt, Halt::WatchdogReset);
}

#[test]
fn reset_cause_is_not_forwarded_when_disabled() {
    let config = BootConfig {
        forward_reset_cause: false,
        ..BootConfig::default()
    };
    let mut mcu = SimulatedMcu::new(M328P);
    let mut eeprom = SimEeprom::new(1024);
    run_serial(&mut mcu, &mut eeprom, &config, &[]);
    let (halt, _) = run_serial(&mut mcu, &mut eeprom, &config, &[]);
    assert_eq!(halt, Halt::StartApplication(ResetCause::NONE));
    assert_eq!(mcu.handoff(), None);
}

#[test]
fn eeprom_write_and_read() {
    let mut config = BootConfig::default();
    config.capabilities.eeprom = true;
    let mut mcu = SimulatedMcu::new(M328P);
    let mut eeprom = SimEeprom::new(1024);
    let script = raw(&[
        Command::LoadAddress { word_address: 0x10 },
        Command::ProgPage {
            memory: MemoryType::Eeprom,
            data: vec![0xc0, 0xff, 0xee, 0x01],
        },
        Command::LoadAddress { word_address: 0x10 },
        Command::ReadPage {
            memory: MemoryType::Eeprom,
            len: 4,
        },
    ]);
    let (_, out) = run_serial(&mut mcu, &mut eeprom, &config, &script);
    assert_eq!(&eeprom.contents()[0x20..0x24], &[0xc0, 0xff, 0xee, 0x01]);
    assert_eq!(eeprom.writes(), 4);
    assert_eq!(&out[6..], &[0x14, 0xc0, 0xff, 0xee, 0x01, 0x10]);
    assert!(mcu.journal().is_empty());
}

#[test]
fn eeprom_type_reads_flash_without_capability() {
    let mut mcu = SimulatedMcu::new(M328P);
    mcu.load_flash(0x20, &[1, 2, 3, 4]).unwrap();
    let script = raw(&[
        Command::LoadAddress { word_address: 0x10 },
        Command::ReadPage {
            memory: MemoryType::Eeprom,
            len: 4,
        },
    ]);
    let (_, out) = run(&mut mcu, &script);
    assert_eq!(&out[2..], &[0x14, 1, 2, 3, 4, 0x10]);
}

#[test]
fn read_page_of_unknown_memory_sends_no_data() {
    let mut config = BootConfig::default();
    config.capabilities.eeprom = true;
    let mut mcu = SimulatedMcu::new(M328P);
    mcu.load_flash(0x20, &[1, 2, 3, 4]).unwrap();
    let mut eeprom = SimEeprom::new(1024);
    let mut script = raw(&[Command::LoadAddress { word_address: 0x10 }]);
    script.extend([0x74, 0x00, 0x04, b'X', 0x20]);
    script.extend(raw(&[Command::read_flash(4)]));
    let (_, out) = run_serial(&mut mcu, &mut eeprom, &config, &script);
    // address unchanged by the ignored read
    assert_eq!(
        out,
        vec![0x14, 0x10, 0x14, 0x10, 0x14, 1, 2, 3, 4, 0x10]
    );
}

#[test]
fn led_flashes_on_entry_and_data() {
    let mut config = BootConfig::default();
    config.capabilities.led_start_flashes = 3;
    let mut mcu = SimulatedMcu::new(M328P);
    let mut eeprom = SimEeprom::new(1024);
    run_serial(&mut mcu, &mut eeprom, &config, &[]);
    assert_eq!(mcu.led_toggles(), 6);

    let mut config = BootConfig::default();
    config.capabilities.led_data_flash = true;
    let mut mcu = SimulatedMcu::new(M328P);
    run_serial(&mut mcu, &mut eeprom, &config, &raw(&[Command::ReadSign]));
    assert_eq!(mcu.led_toggles(), 2);
}

#[test]
fn data_led_ignores_radio_bytes() {
    let mut config = BootConfig {
        transport: TransportKind::Radio,
        ..BootConfig::default()
    };
    config.capabilities.led_data_flash = true;
    let mut radio = LoopbackRadio::new();
    radio.push_packet(&[0x00, 0x30, 0x20, 0x75, 0x20]);
    let mut link = RadioLink::new(radio);
    let mut mcu = SimulatedMcu::new(M328P);
    let mut eeprom = SimEeprom::new(1024);

    boot(&mut mcu, &mut link, &mut eeprom, M328P, &config);
    assert_eq!(
        reassemble(link.radio().sent()),
        vec![0x14, 0x10, 0x14, 0x1e, 0x95, 0x0f, 0x10]
    );
    assert_eq!(mcu.led_toggles(), 0);
}

#[test]
fn disabled_session_timeout_still_ends_in_reset() {
    let config = BootConfig {
        session_timeout: WatchdogTimeout::Off,
        ..BootConfig::default()
    };
    let mut mcu = SimulatedMcu::new(M328P);
    let mut eeprom = SimEeprom::new(1024);
    let (halt, out) = run_serial(&mut mcu, &mut eeprom, &config, &[]);
    assert_eq!(halt, Halt::WatchdogReset);
    assert!(out.is_empty());
    let (halt, _) = run_serial(&mut mcu, &mut eeprom, &config, &[]);
    assert!(matches!(halt, Halt::StartApplication(_)));
}

#[test]
fn whole_image_over_serial() {
    let firmware = Firmware::from_binary((0..300u32).map(|i| (i % 251) as u8).collect());
    let programmer = Programmer::new(M328P);
    let session = programmer.plan(&firmware).unwrap();

    let mut mcu = SimulatedMcu::new(M328P);
    let (halt, out) = run(&mut mcu, &session.script());
    assert_eq!(halt, Halt::WatchdogReset);

    let report = programmer.check(&session, &firmware, &out).unwrap();
    assert_eq!(report.signature, [0x1e, 0x95, 0x0f]);
    assert_eq!(report.version, (5, 0));
    assert_eq!(report.pages_written, 3);
    assert_eq!(report.verified, Some(true));
    assert_eq!(&mcu.flash()[..300], &firmware.data[..]);
    assert!(mcu.flash()[300..384].iter().all(|&b| b == 0xff));

    let (halt, _) = run(&mut mcu, &[]);
    assert!(matches!(halt, Halt::StartApplication(_)));
}

#[test]
fn upper_bank_page_on_large_part() {
    let params = ChipDB::load()
        .unwrap()
        .find_chip("ATmega1284P")
        .unwrap()
        .params();
    let firmware = Firmware {
        base: 0x1_0000,
        data: vec![0x5a; 256],
    };
    let programmer = Programmer::new(params);
    let session = programmer.plan(&firmware).unwrap();

    let mut mcu = SimulatedMcu::new(params);
    let (_, out) = run(&mut mcu, &session.script());
    let report = programmer.check(&session, &firmware, &out).unwrap();
    assert_eq!(report.verified, Some(true));
    assert_eq!(&mcu.flash()[0x1_0000..0x1_0100], &[0x5a; 256][..]);
    assert!(mcu.flash()[..0x100].iter().all(|&b| b == 0xff));
}

#[test]
fn whole_image_over_lossy_radio() {
    let config = BootConfig {
        transport: TransportKind::Radio,
        ..BootConfig::default()
    };
    let firmware = Firmware::from_binary((0..700u32).map(|i| (i * 13) as u8).collect());
    let programmer = Programmer::new(M328P);
    let session = programmer.plan(&firmware).unwrap();

    let mut radio = LoopbackRadio::with_seed(7);
    radio.set_ack_loss(0.3);
    radio.set_duplicate_rate(0.3);
    for packet in session.packets(0) {
        radio.push_packet(&packet);
    }
    let mut link = RadioLink::new(radio);
    let mut mcu = SimulatedMcu::new(M328P);
    let mut eeprom = SimEeprom::new(1024);

    let halt = boot(&mut mcu, &mut link, &mut eeprom, M328P, &config);
    assert_eq!(halt, Halt::WatchdogReset);
    assert_eq!(link.abandoned(), 0);
    assert!(link.radio().sent().iter().all(|p| p.len() <= 32));

    let out = reassemble(link.radio().sent());
    let report = programmer.check(&session, &firmware, &out).unwrap();
    assert_eq!(report.verified, Some(true));
    assert_eq!(&mcu.flash()[..700], &firmware.data[..]);
}

#[test]
fn missing_radio_parks_until_watchdog() {
    let config = BootConfig {
        transport: TransportKind::Radio,
        ..BootConfig::default()
    };
    let mut radio = LoopbackRadio::new();
    radio.set_present(false);
    let mut link = RadioLink::new(radio);
    let mut mcu = SimulatedMcu::new(M328P);
    let mut eeprom = SimEeprom::new(1024);

    assert_eq!(
        boot(&mut mcu, &mut link, &mut eeprom, M328P, &config),
        Halt::WatchdogReset
    );
    assert!(!link.radio().listening());
    // the marker armed on entry takes us to the application next
    assert!(matches!(
        boot(&mut mcu, &mut link, &mut eeprom, M328P, &config),
        Halt::StartApplication(_)
    ));
}
