mod common;

use common::{count, setup, setup_with, BLOCKS};
use libdhi::{
    CoincidenceMode, DeviceCode, DhiError, EnergyWindow, ErrorKind, HeadMode, HeadSel, Outcome,
    Setting, SimulatedScanner, SimulationConfig, ALL_BLOCKS,
};
use std::time::{Duration, Instant};

fn window() -> EnergyWindow {
    EnergyWindow::new(250, 700).unwrap()
}

#[test]
fn ensure_mode_refreshes_then_selects_and_sets_once() {
    let (mut c, sim) = setup();
    assert!(!c.trusted(0, 2));

    let issued = c.ensure_mode(2, HeadMode::Run, ALL_BLOCKS, window()).unwrap();
    assert!(issued);
    let commands = sim.commands();
    let reads: Vec<_> = commands.iter().filter(|c| c.starts_with("2G 0 ")).collect();
    assert_eq!(reads.len(), BLOCKS as usize);
    assert_eq!(
        &commands[commands.len() - 2..],
        &["2I 255".to_string(), "2M 0 0 250 700".to_string()]
    );
    assert!(c.trusted(0, 2));
    let state = c.head_mode(2).unwrap();
    assert_eq!(state.mode, HeadMode::Run);
    assert_eq!(state.block, ALL_BLOCKS);

    let before = sim.exchanges();
    let issued = c.ensure_mode(2, HeadMode::Run, ALL_BLOCKS, window()).unwrap();
    assert!(!issued);
    assert_eq!(sim.exchanges(), before);
}

#[test]
fn ensure_mode_rechecks_a_suspect_head() {
    let (mut c, sim) = setup();
    c.ensure_mode(1, HeadMode::Run, ALL_BLOCKS, window()).unwrap();

    // Singles still flowing: the belief holds.
    c.mark_mode_suspect(1);
    assert!(!c.ensure_mode(1, HeadMode::Run, ALL_BLOCKS, window()).unwrap());

    sim.restart_head(1);
    c.mark_mode_suspect(1);
    sim.clear_commands();
    assert!(c.ensure_mode(1, HeadMode::Run, ALL_BLOCKS, window()).unwrap());
    assert_eq!(count(&sim, "1K 255"), 1);
    assert_eq!(count(&sim, "1M 0 0 250 700"), 1);
    assert_eq!(sim.head_mode(1), Some(HeadMode::Run));
}

#[test]
fn test_mode_is_refused_without_touching_the_link() {
    let (mut c, sim) = setup();
    let result = c.set_head_mode(HeadSel::One(2), HeadMode::Test, ALL_BLOCKS, window());
    let err = result.as_ref().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);
    assert_eq!(sim.exchanges(), 0);

    let outcome = Outcome::from(&result);
    assert!(!outcome.success);
    assert!(outcome.message.contains("set_head_mode"));
    assert!(outcome.message.contains("head 2"));
    assert_eq!(c.errors().len(), 1);
}

#[test]
fn set_head_mode_on_all_heads_stops_at_first_failure() {
    let (mut c, sim) = setup();
    sim.silence_head(1, true);
    let err = c
        .set_head_mode(HeadSel::All, HeadMode::Energy, 3, window())
        .unwrap_err();
    assert!(matches!(err.source, DhiError::Timeout(_)));
    assert_eq!(err.head, Some(1));
    assert!(err.to_string().contains("head 1"));
    assert_eq!(c.errors().last().unwrap().head, Some(1));
    assert_eq!(c.head_mode(0).map(|s| s.mode), Some(HeadMode::Energy));
    assert!(c.head_mode(1).is_none());
    assert_eq!(sim.head_exchanges(2), 0);
    assert_eq!(sim.head_exchanges(3), 0);
}

#[test]
fn set_test_mode_and_verify() {
    let (mut c, sim) = setup();
    assert_eq!(c.verify_head_mode(0).unwrap(), None);
    c.set_test_mode(0, 4).unwrap();
    assert_eq!(sim.head_mode(0), Some(HeadMode::Test));
    let state = c.verify_head_mode(0).unwrap().unwrap();
    assert_eq!(state.mode, HeadMode::Test);
    assert_eq!(state.block, 4);
    assert_eq!(c.head_mode(0), Some(state));
}

#[test]
fn upload_of_missing_file_is_empty_after_delay() {
    let timing = SimulationConfig {
        file_delay_ms: 50,
        ..common::timing()
    };
    let (mut c, sim) = setup_with(common::config(), timing);
    let started = Instant::now();
    let data = c.upload(3, "h3_settings.txt").unwrap();
    assert!(data.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(sim.exchanges(), 1);
}

#[test]
fn download_then_upload_round_trips() {
    let (mut c, sim) = setup();
    let image: Vec<u8> = (0..600u32).map(|i| (i * 7 % 256) as u8).collect();
    c.download(1, "table.bin", &image).unwrap();
    assert_eq!(sim.file(1, "table.bin"), Some(image.clone()));
    assert_eq!(c.upload(1, "table.bin").unwrap(), image);

    let exact = vec![0xA5u8; 512];
    c.download(1, "exact.bin", &exact).unwrap();
    assert_eq!(count(&sim, "1D exact.bin 2 - 0000"), 1);
    assert_eq!(c.upload(1, "exact.bin").unwrap(), exact);
}

#[test]
fn corrupted_chunk_restarts_the_whole_upload_once() {
    let (mut c, sim) = setup();
    let image = vec![1u8; 700];
    c.download(2, "fw.bin", &image).unwrap();
    sim.clear_commands();

    sim.corrupt_upload_chunks(1);
    assert_eq!(c.upload(2, "fw.bin").unwrap(), image);
    assert_eq!(count(&sim, "2U fw.bin 0"), 2);
    assert_eq!(count(&sim, "2U fw.bin 2"), 1);
}

#[test]
fn five_corrupted_passes_are_a_checksum_error() {
    let (mut c, sim) = setup();
    c.download(2, "fw.bin", &[9u8; 300]).unwrap();
    sim.clear_commands();

    sim.corrupt_upload_chunks(5);
    let err = c.upload(2, "fw.bin").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Checksum);
    assert_eq!(count(&sim, "2U fw.bin 0"), 5);
    assert_eq!(c.errors().last().unwrap().kind, ErrorKind::Checksum);
}

fn download_chunks_sent(sim: &SimulatedScanner, chunk: u32) -> usize {
    let prefix = format!("2D fw.bin {} ", chunk);
    sim.commands().iter().filter(|c| c.starts_with(&prefix)).count()
}

#[test]
fn rejected_download_chunk_restarts_the_transfer() {
    let (mut c, sim) = setup();
    let image: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
    sim.corrupt_download_chunk(1, 1);

    c.download(2, "fw.bin", &image).unwrap();
    assert_eq!(sim.file(2, "fw.bin"), Some(image));
    assert_eq!(download_chunks_sent(&sim, 0), 2);
    assert_eq!(download_chunks_sent(&sim, 1), 2);
    assert_eq!(download_chunks_sent(&sim, 2), 1);
}

#[test]
fn five_rejected_download_passes_are_a_checksum_error() {
    let (mut c, sim) = setup();
    sim.corrupt_download_chunk(0, 5);

    let err = c.download(2, "fw.bin", &[7u8; 300]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Checksum);
    assert_eq!(err.head, Some(2));
    assert_eq!(download_chunks_sent(&sim, 0), 5);
    assert_eq!(download_chunks_sent(&sim, 1), 0);
    assert_eq!(sim.file(2, "fw.bin"), None);
    assert_eq!(c.errors().last().unwrap().kind, ErrorKind::Checksum);
}

#[test]
fn set_settings_round_trips_and_stays_trusted() {
    let (mut c, sim) = setup();
    let mut table = c.get_settings(0, 3).unwrap();
    table.set(5, Setting::Cfd, 70);
    for b in 0..6 {
        table.set(b, Setting::EOffset, 140);
    }
    for (i, s) in Setting::GAINS.iter().enumerate() {
        table.set(2, *s, 90 + i as i32);
    }
    sim.clear_commands();

    let sent = c.set_settings(0, 3, &table).unwrap();
    let commands = sim.commands();
    assert_eq!(sent, commands.len());
    assert!(commands.contains(&"3S 0 255 8 140".to_string()));
    assert!(commands.contains(&"3S 0 2 100 90 91 92 93".to_string()));
    assert!(commands.contains(&"3S 0 5 4 70".to_string()));
    assert!(commands.contains(&"3S 0 7 8 128".to_string()));

    assert!(c.trusted(0, 3));
    sim.clear_commands();
    assert_eq!(c.get_settings(0, 3).unwrap(), table);
    assert_eq!(sim.exchanges(), 0);

    for b in 0..BLOCKS {
        for s in Setting::ALL {
            assert_eq!(sim.setting(0, 3, b, s), table.get(b, s));
        }
    }
}

#[test]
fn set_settings_rejects_out_of_range_values_before_io() {
    let (mut c, sim) = setup();
    let mut table = libdhi::SettingsTable::new(BLOCKS);
    table.set(0, Setting::CfdDelay, 40);
    let err = c.set_settings(0, 1, &table).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);
    assert_eq!(sim.exchanges(), 0);
}

#[test]
fn refresh_returns_device_values_and_trusts_them() {
    let (mut c, sim) = setup();
    c.get_settings(0, 0).unwrap();
    sim.poke_setting(0, 0, 6, Setting::XOffset, 99);
    // Still trusted locally: the change happened behind our back.
    assert_eq!(c.get_settings(0, 0).unwrap().get(6, Setting::XOffset), Some(128));

    let table = c.refresh_settings(0, 0).unwrap();
    assert_eq!(table.get(6, Setting::XOffset), Some(99));
    assert!(c.trusted(0, 0));
    assert_eq!(c.get_settings(0, 0).unwrap(), table);
}

#[test]
fn block_checksum_mismatch_is_retried_then_surfaced() {
    let (mut c, sim) = setup();
    sim.corrupt_settings_sums(2);
    c.refresh_settings(0, 1).unwrap();
    assert!(c.trusted(0, 1));

    sim.corrupt_settings_sums(100);
    let err = c.refresh_settings(0, 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Checksum);
    assert!(!c.trusted(0, 2));
}

#[test]
fn cached_table_is_accepted_on_matching_checksum() {
    let (mut c, sim) = setup();
    c.get_settings(1, 1).unwrap();
    c.invalidate_settings(1, 1);
    sim.clear_commands();

    c.get_settings(1, 1).unwrap();
    assert_eq!(sim.commands(), vec!["1G 1 255".to_string()]);
    assert!(c.trusted(1, 1));

    c.invalidate_settings(1, 1);
    sim.poke_setting(1, 1, 0, Setting::TdcGain, 3);
    sim.clear_commands();
    let table = c.get_settings(1, 1).unwrap();
    assert_eq!(table.get(0, Setting::TdcGain), Some(3));
    assert_eq!(sim.exchanges(), 1 + BLOCKS as usize);
}

#[test]
fn snapshots_warm_start_an_untrusted_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = libdhi::ControllerConfig {
        settings_dir: Some(dir.path().to_path_buf()),
        ..common::config()
    };
    let (mut c, _sim) = setup_with(config.clone(), common::timing());
    c.get_settings(0, 2).unwrap();
    assert!(dir.path().join("h2_c0_settings.txt").exists());
    drop(c);

    let (mut c, sim) = setup_with(config, common::timing());
    assert!(!c.trusted(0, 2));
    c.get_settings(0, 2).unwrap();
    assert_eq!(sim.commands(), vec!["2G 0 255".to_string()]);
    assert!(c.trusted(0, 2));
}

#[test]
fn calibration_downgrades_out_of_range_and_distrusts_cache() {
    let (mut c, sim) = setup();
    c.get_settings(0, 1).unwrap();
    sim.calibration_out_of_range(true);

    let reports = c.determine_offsets(HeadSel::One(1), ALL_BLOCKS).unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].warning, Some(DeviceCode::OutOfRange));
    assert!(!c.trusted(0, 1));
    let entry = c.errors().last().unwrap();
    assert!(!entry.fatal);
    assert_eq!(entry.code, -7);

    let table = c.get_settings(0, 1).unwrap();
    assert_ne!(table.get(0, Setting::XOffset), Some(128));
}

#[test]
fn zap_restores_defaults() {
    let (mut c, _sim) = setup();
    let mut table = c.get_settings(0, 0).unwrap();
    table.set(3, Setting::Cfd, 12);
    c.set_settings(0, 0, &table).unwrap();

    let reports = c.zap(HeadSel::All, ALL_BLOCKS).unwrap();
    assert_eq!(reports.len(), common::HEADS as usize);
    assert!(reports.iter().all(|r| r.warning.is_none()));
    assert_eq!(c.get_settings(0, 0).unwrap().get(3, Setting::Cfd), Some(64));
}

#[test]
fn zap_forgets_head_mode() {
    let (mut c, sim) = setup();
    c.ensure_mode(1, HeadMode::Run, ALL_BLOCKS, window()).unwrap();
    assert!(c.head_mode(1).is_some());

    c.zap(HeadSel::One(1), ALL_BLOCKS).unwrap();
    assert!(c.head_mode(1).is_none());
    sim.clear_commands();
    assert!(c.ensure_mode(1, HeadMode::Run, ALL_BLOCKS, window()).unwrap());
    assert_eq!(count(&sim, "1M 0 0 250 700"), 1);
}

#[test]
fn determine_delay_polls_until_done() {
    let (mut c, sim) = setup();
    c.determine_delay(HeadSel::One(3), 2).unwrap();
    assert!(count(&sim, "3P") >= 1);
    assert_eq!(sim.setting(0, 3, 2, Setting::CfdDelay), Some(14));
    assert!(c.progress(3).unwrap().percent >= 100);
}

#[test]
fn busy_head_rejects_other_commands() {
    let (mut c, _sim) = setup_with(
        common::config(),
        SimulationConfig {
            operation_ms: 60_000,
            ..common::timing()
        },
    );
    c.raw_command("0Z 0 255").unwrap();
    let progress = c.progress(0).unwrap();
    assert!(progress.percent < 100);
    assert!(progress.remaining_s > 0);
    let err = c.statistics(0).unwrap_err();
    assert_eq!(err.source.device_code(), Some(DeviceCode::Busy));
}

#[test]
fn reboot_forgets_mode_and_trust() {
    let (mut c, sim) = setup();
    c.ensure_mode(2, HeadMode::Run, ALL_BLOCKS, window()).unwrap();
    c.reboot(HeadSel::One(2)).unwrap();
    assert!(c.head_mode(2).is_none());
    assert!(!c.trusted(0, 2));
    assert_eq!(sim.head_mode(2), None);

    sim.clear_commands();
    assert!(c.ensure_mode(2, HeadMode::Run, ALL_BLOCKS, window()).unwrap());
    assert_eq!(sim.commands(), vec![
        "2G 0 255".to_string(),
        "2I 255".to_string(),
        "2M 0 0 250 700".to_string(),
    ]);
}

#[test]
fn reboot_all_names_the_silent_head() {
    let (mut c, sim) = setup();
    sim.silence_head(2, true);
    let err = c.reboot(HeadSel::All).unwrap_err();
    assert!(matches!(err.source, DhiError::Timeout(_)));
    assert_eq!(err.head, Some(2));
    assert!(err.to_string().starts_with("reboot (head 2): "));
    let entry = c.errors().last().unwrap();
    assert_eq!(entry.head, Some(2));
    assert_eq!(count(&sim, "3R 999"), 0);
}

#[test]
fn high_voltage_on_all_heads_names_the_failing_head() {
    let (mut c, sim) = setup();
    sim.silence_head(3, true);
    let err = c.set_high_voltage(HeadSel::All, true).unwrap_err();
    assert_eq!(err.head, Some(3));
    assert!(err.to_string().contains("head 3"));
    assert_eq!(count(&sim, "0H 1"), 1);
}

#[test]
fn health_check_marks_silent_heads_absent() {
    let (mut c, sim) = setup();
    sim.silence_head(3, true);
    let report = c.health_check().unwrap();
    assert_eq!(report.len(), 4);
    assert!(report[0].alive());
    assert!(report[0].firmware.as_deref().unwrap().starts_with("DHI-SIM"));
    assert!(!report[3].alive());
    assert!(!c.geometry().heads()[3].present);

    sim.clear_commands();
    assert_eq!(c.ping(3).unwrap_err().kind(), ErrorKind::Argument);
    assert_eq!(sim.exchanges(), 0);

    sim.silence_head(3, false);
    c.health_check().unwrap();
    assert!(c.ping(3).is_ok());
}

#[test]
fn queries_parse_device_fields() {
    let (mut c, _sim) = setup();
    c.ensure_mode(0, HeadMode::Run, ALL_BLOCKS, window()).unwrap();
    let stats = c.statistics(0).unwrap();
    assert!(stats.total > 0);
    assert!(stats.valid <= stats.total);

    assert_eq!(c.singles(0, ALL_BLOCKS).unwrap().len(), BLOCKS as usize);
    assert_eq!(c.singles(0, 3).unwrap(), vec![1030]);
    assert_eq!(c.singles(0, 8).unwrap_err().kind(), ErrorKind::Argument);

    let ring = c.ring_singles().unwrap();
    assert_eq!(ring.len(), 4);
    assert!(ring[0] > 0);
    assert_eq!(ring[1], 0);

    let v = c.voltages(0).unwrap();
    assert!((v.temperature_c - 31.2).abs() < 1e-9);
    assert_eq!(c.diagnostics(0).unwrap(), vec![0, 0, 0, 0]);
}

#[test]
fn coincidence_processor_modes_and_window() {
    let (mut c, sim) = setup();
    c.set_coincidence_mode(2).unwrap();
    assert_eq!(sim.coincidence_mode(), Some(CoincidenceMode::Coincidence { span: 2 }));
    assert_eq!(c.set_coincidence_mode(4).unwrap_err().kind(), ErrorKind::Argument);

    c.set_passthrough_mode(&[0, 2]).unwrap();
    assert_eq!(count(&sim, "64M 1 5"), 1);
    c.set_tagword_mode().unwrap();
    c.set_cp_test_mode(7).unwrap();
    c.set_time_mode(3).unwrap();
    assert_eq!(c.coincidence_mode(), Some(CoincidenceMode::Time { head: 3 }));

    c.set_time_window(10).unwrap();
    assert_eq!(c.time_window().unwrap(), (10, 0));
    assert!(c.set_time_window(1).is_err());

    let rate = c.count_rate().unwrap();
    assert_eq!(rate.singles, 0);
}

#[test]
fn initialize_scan_brings_up_every_head() {
    let (mut c, sim) = setup();
    c.initialize_scan(window(), 2).unwrap();
    for head in 0..common::HEADS {
        assert_eq!(sim.head_mode(head), Some(HeadMode::Run));
        assert!(c.trusted(0, head));
    }
    assert!(c.count_rate().unwrap().prompts > 0);
}

#[test]
fn tags_need_tag_control() {
    let (mut c, sim) = setup();
    let err = c.insert_tag(0xBEEF).unwrap_err();
    assert_eq!(err.source.device_code(), Some(DeviceCode::WrongMode));
    c.set_tag_control(true).unwrap();
    c.insert_tag(0xBEEF).unwrap();
    assert_eq!(sim.tags(), vec![0xBEEF]);
}

#[test]
fn power_and_source_controls() {
    let (mut c, sim) = setup();
    c.set_high_voltage_level(1, 1200).unwrap();
    c.set_high_voltage(HeadSel::One(1), true).unwrap();
    assert_eq!(sim.high_voltage(1), Some((true, 1200)));
    assert_eq!(c.voltages(1).unwrap().high_voltage, 1200);

    sim.clear_commands();
    assert_eq!(c.set_high_voltage_level(1, 1600).unwrap_err().kind(), ErrorKind::Argument);
    assert_eq!(c.set_temperature_limits(1, 40, 30).unwrap_err().kind(), ErrorKind::Argument);
    assert_eq!(c.transmission_trajectory(4, 1).unwrap_err().kind(), ErrorKind::Argument);
    assert_eq!(sim.exchanges(), 0);

    c.set_point_source(1, true).unwrap();
    assert_eq!(sim.point_source_on(1), Some(true));
    c.set_temperature_limits(1, 15, 40).unwrap();
    assert_eq!(c.temperature_limits(1).unwrap(), (15, 40));
    c.transmission_trajectory(2, 5).unwrap();
    assert_eq!(sim.trajectory(), Some((2, 5)));
}

#[test]
fn firmware_load_flashes_after_download() {
    let (mut c, sim) = setup();
    c.ensure_mode(0, HeadMode::Run, ALL_BLOCKS, window()).unwrap();
    c.load_firmware(0, "head.bin", &[0x42; 1000]).unwrap();
    assert_eq!(count(&sim, "0O flash head.bin"), 1);
    assert!(c.head_mode(0).is_none());

    let err = c.load_ram(0, "bad name", &[1]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);
    c.load_ram(0, "diag.bin", &[1, 2, 3]).unwrap();
    assert_eq!(count(&sim, "0O ramload diag.bin"), 1);
}

#[test]
fn raw_and_os_commands_pass_through() {
    let (mut c, _sim) = setup();
    c.ensure_mode(2, HeadMode::Run, ALL_BLOCKS, window()).unwrap();
    let r = c.raw_command("2Q 2").unwrap();
    assert_eq!(r.fields[0], "DHI-SIM");
    assert!(c.head_mode(2).is_some());

    c.raw_command("2I 3").unwrap();
    assert!(c.head_mode(2).is_none());
    assert_eq!(c.raw_command("2W").unwrap_err().kind(), ErrorKind::Argument);

    assert_eq!(c.os_command(2, "ls -l").unwrap(), "ok ls -l");
    let err = c.raw_command("2M 9 0 1 2").unwrap_err();
    assert_eq!(err.code(), -2);
}

#[test]
fn logging_toggle_and_async_mailbox() {
    let (mut c, sim) = setup();
    assert!(!c.logging());
    c.set_logging(true);
    assert!(c.logging());
    c.ping(0).unwrap();
    c.set_logging(false);

    assert!(c.take_async().is_none());
    sim.push_async(libdhi::AsyncNotice {
        head: Some(0),
        payload: libdhi::AsyncPayload::Message("first".into()),
    });
    sim.push_async(libdhi::AsyncNotice {
        head: Some(0),
        payload: libdhi::AsyncPayload::Message("second".into()),
    });
    let notice = c.take_async().unwrap();
    assert_eq!(notice.payload, libdhi::AsyncPayload::Message("second".into()));
    assert!(c.take_async().is_none());
}

#[test]
fn error_table_recycles_oldest_entries() {
    let config = libdhi::ControllerConfig {
        error_capacity: 3,
        ..common::config()
    };
    let (mut c, _sim) = setup_with(config, common::timing());
    for head in 10..15 {
        assert!(c.ping(head).is_err());
    }
    assert_eq!(c.errors().len(), 3);
    assert_eq!(c.errors().total(), 5);
    let first = c.errors().entries().next().unwrap();
    assert!(first.message.contains("head 12"));
}
