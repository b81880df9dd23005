// CLASSIFICATION: COMMUNITY
// Filename: test_boot_lifecycle.rs v0.1
// Date Modified: 2026-10-19
// Author: Lukas Bower

use std::sync::Arc;

use cohesix_pil::mdt::PhdrFlags;
use cohesix_pil::pm;
use cohesix_pil::sim::{DigestVerifier, MdtBuilder, SimIrq, SimOps, SimPlatform, SimRamdump};
use cohesix_pil::{
    set_config, BootState, Descriptor, DescriptorConfig, HookStage, PilConfig, PilError,
    ProxyTimeout, RamdumpSegment,
};
use serial_test::serial;

const RELOC_BASE: u64 = 0x8000_0000;

fn init() -> SimPlatform {
    let _ = env_logger::builder().is_test(true).try_init();
    set_config(PilConfig {
        proxy_timeout: ProxyTimeout::Driver,
    })
    .unwrap();
    SimPlatform::new(0x10_0000, RELOC_BASE, 0x40_0000)
}

/// One relocatable segment at header address 0 and one fixed at 0x1000.
fn mixed_image(sim: &SimPlatform, reloc_file: usize) {
    let mdt = MdtBuilder::new(0)
        .segment(0, 0x1000, 0x600, PhdrFlags::RELOCATABLE | PhdrFlags::READ | PhdrFlags::EXEC, 0x1000)
        .segment(0x1000, 0x1000, 0x1000, PhdrFlags::READ | PhdrFlags::WRITE, 0x1000)
        .hash_segment(0x100)
        .build();
    sim.firmware.insert("modem.mdt", mdt);
    sim.firmware.insert("modem.b00", vec![0xA5; reloc_file]);
    sim.firmware.insert("modem.b01", vec![0x5A; 0x1000]);
}

fn descriptor(sim: &SimPlatform, ops: &Arc<SimOps>) -> Descriptor {
    let config = DescriptorConfig::new("modem").proxy_timeout_ms(60_000);
    Descriptor::new(config, sim.platform(), ops.clone()).unwrap()
}

#[test]
#[serial]
fn mixed_image_boots_and_shuts_down() {
    let sim = init();
    mixed_image(&sim, 0x600);
    sim.memory.fill(RELOC_BASE, 0x1000, 0xFF);
    let ops = SimOps::new();
    let desc = descriptor(&sim, &ops);
    assert_eq!(desc.entry_address(), 0);

    desc.boot().unwrap();
    assert_eq!(desc.state(), BootState::Running);
    assert_eq!(desc.segment_count(), 2);
    assert_eq!(desc.entry_address(), RELOC_BASE);
    assert_eq!(sim.allocator.alloc_calls(), 1);
    assert_eq!(sim.allocator.live(), 1);
    assert_eq!(ops.mem_setups(), vec![(RELOC_BASE, 0x1000)]);
    assert_eq!(
        ops.calls(),
        vec!["proxy_vote", "init_image", "mem_setup", "auth_and_reset"]
    );
    assert_eq!(sim.firmware.outstanding("modem.mdt"), 0);

    let reloc = sim.memory.read(RELOC_BASE, 0x1000).unwrap();
    assert!(reloc[..0x600].iter().all(|&b| b == 0xA5));
    assert!(reloc[0x600..].iter().all(|&b| b == 0));
    let fixed = sim.memory.read(0x1000, 0x1000).unwrap();
    assert!(fixed.iter().all(|&b| b == 0x5A));

    desc.shutdown().unwrap();
    assert_eq!(desc.state(), BootState::Idle);
    assert_eq!(desc.segment_count(), 0);
    assert_eq!(sim.allocator.live(), 0);
    assert_eq!(ops.count("shutdown"), 1);
    assert_eq!(ops.unvotes(), 1);
}

#[test]
#[serial]
fn short_blob_unwinds_the_attempt() {
    let sim = init();
    mixed_image(&sim, 0x500);
    let ops = SimOps::new();
    let desc = descriptor(&sim, &ops);
    let wake_before = pm::wake_sources_active();

    let err = desc.boot().unwrap_err();
    assert!(matches!(err, PilError::Integrity(_)), "{err}");
    assert_eq!(desc.state(), BootState::Failed);
    assert_eq!(desc.segment_count(), 0);
    assert_eq!(desc.entry_address(), 0);
    assert!(!desc.has_region());
    assert_eq!(sim.allocator.live(), 0);
    assert_eq!(sim.allocator.free_calls(), 1);
    assert_eq!(sim.firmware.outstanding("modem.mdt"), 0);
    assert_eq!(ops.votes(), 1);
    assert_eq!(ops.unvotes(), 1);
    assert_eq!(ops.count("deinit_image"), 1);
    assert_eq!(ops.count("auth_and_reset"), 0);
    assert_eq!(pm::wake_sources_active(), wake_before);
}

#[test]
#[serial]
fn second_boot_reuses_the_region() {
    let sim = init();
    mixed_image(&sim, 0x600);
    let ops = SimOps::new();
    let desc = descriptor(&sim, &ops);

    desc.boot().unwrap();
    desc.boot().unwrap();
    assert_eq!(desc.segment_count(), 2);
    assert_eq!(sim.allocator.alloc_calls(), 1);
    assert_eq!(sim.allocator.live(), 1);
    // the first boot's deferred release ran before the second vote
    assert_eq!(ops.votes(), 2);
    assert_eq!(ops.unvotes(), 1);

    desc.shutdown().unwrap();
    assert_eq!(ops.unvotes(), 2);
    assert_eq!(sim.allocator.live(), 0);
}

#[test]
#[serial]
fn reboot_before_interrupt_returns_the_first_vote() {
    let sim = init();
    mixed_image(&sim, 0x600);
    let ops = SimOps::new();
    let irq = SimIrq::new();
    let config = DescriptorConfig::new("modem").unvote_irq(irq.clone());
    let desc = Descriptor::new(config, sim.platform(), ops.clone()).unwrap();

    desc.boot().unwrap();
    assert_eq!(ops.unvotes(), 0);
    desc.boot().unwrap();
    assert_eq!((ops.votes(), ops.unvotes()), (2, 1));
    assert!(irq.is_enabled());

    assert!(irq.fire());
    assert_eq!(ops.unvotes(), 2);
    desc.shutdown().unwrap();
    assert_eq!((ops.votes(), ops.unvotes()), (2, 2));
}

#[test]
#[serial]
fn reboot_while_holding_votes_returns_the_first_vote() {
    let sim = init();
    set_config(PilConfig {
        proxy_timeout: ProxyTimeout::HoldUntilShutdown,
    })
    .unwrap();
    mixed_image(&sim, 0x600);
    let ops = SimOps::new();
    let desc = descriptor(&sim, &ops);
    let wake_before = pm::wake_sources_active();

    desc.boot().unwrap();
    desc.boot().unwrap();
    assert_eq!((ops.votes(), ops.unvotes()), (2, 1));
    assert_eq!(pm::wake_sources_active(), wake_before + 1);

    desc.shutdown().unwrap();
    assert_eq!((ops.votes(), ops.unvotes()), (2, 2));
    assert_eq!(pm::wake_sources_active(), wake_before);
    set_config(PilConfig {
        proxy_timeout: ProxyTimeout::Driver,
    })
    .unwrap();
}

#[test]
#[serial]
fn larger_image_cannot_reuse_a_live_region() {
    let sim = init();
    mixed_image(&sim, 0x600);
    let ops = SimOps::new();
    let desc = descriptor(&sim, &ops);
    desc.boot().unwrap();

    let bigger = MdtBuilder::new(0)
        .segment(0, 0x2000, 0x600, PhdrFlags::RELOCATABLE, 0x1000)
        .build();
    sim.firmware.insert("modem.mdt", bigger);
    let err = desc.boot().unwrap_err();
    assert!(matches!(err, PilError::Sizing { have: 0x1000, need: 0x2000 }));
    assert_eq!(sim.allocator.live(), 0);

    desc.boot().unwrap();
    assert_eq!(sim.allocator.alloc_calls(), 2);
    assert_eq!(sim.allocator.live(), 1);
}

#[test]
#[serial]
fn fixed_image_over_host_memory_is_refused() {
    let sim = init();
    sim.memory.reserve_host(0x2000, 0x1000);
    let mdt = MdtBuilder::new(0x1800)
        .segment(0x1800, 0x1000, 0, PhdrFlags::READ, 0x1000)
        .build();
    sim.firmware.insert("modem.mdt", mdt);
    let ops = SimOps::new();
    let desc = descriptor(&sim, &ops);

    let err = desc.boot().unwrap_err();
    assert!(matches!(err, PilError::Permission { start: 0x1800, end: 0x2800 }));
    assert_eq!(sim.allocator.alloc_calls(), 0);
    assert!(ops.calls().is_empty());
}

#[test]
#[serial]
fn entry_outside_every_segment() {
    let sim = init();
    let mdt = MdtBuilder::new(0x9000)
        .segment(0x1000, 0x1000, 0, PhdrFlags::READ, 0x1000)
        .build();
    sim.firmware.insert("modem.mdt", mdt);
    let ops = SimOps::new();

    let strict = descriptor(&sim, &ops);
    assert!(matches!(
        strict.boot(),
        Err(PilError::UnreachableEntryPoint(0x9000))
    ));
    assert!(ops.calls().is_empty());
    strict.release();

    let config = DescriptorConfig::new("modem").skip_entry_check(true);
    let lenient = Descriptor::new(config, sim.platform(), ops.clone()).unwrap();
    lenient.boot().unwrap();
    assert_eq!(lenient.entry_address(), 0x9000);
}

#[test]
#[serial]
fn relocated_entry_must_land_in_a_relocated_segment() {
    let sim = init();
    // the relocated entry 0x1800 -> RELOC_BASE + 0x1800 lands in the fixed segment
    let mdt = MdtBuilder::new(0x1800)
        .segment(0, 0x1000, 0, PhdrFlags::RELOCATABLE, 0x1000)
        .segment(RELOC_BASE + 0x1000, 0x1000, 0, PhdrFlags::READ, 0x1000)
        .build();
    sim.firmware.insert("modem.mdt", mdt);
    let ops = SimOps::new();
    let desc = descriptor(&sim, &ops);

    assert!(matches!(
        desc.boot(),
        Err(PilError::UnreachableEntryPoint(e)) if e == RELOC_BASE + 0x1800
    ));
    assert_eq!(sim.allocator.live(), 0);
    assert!(ops.calls().is_empty());
}

#[test]
#[serial]
fn oversized_file_is_rejected_before_memory_is_touched() {
    let sim = init();
    let mdt = MdtBuilder::new(0x1000)
        .segment(0x1000, 0x800, 0x1000, PhdrFlags::READ, 0x1000)
        .build();
    sim.firmware.insert("modem.mdt", mdt);
    sim.firmware.insert("modem.b00", vec![0; 0x1000]);
    let ops = SimOps::new();
    let desc = descriptor(&sim, &ops);
    let maps = sim.memory.map_count();

    assert!(matches!(desc.boot(), Err(PilError::Integrity(_))));
    assert_eq!(sim.memory.map_count(), maps);
    assert!(!sim.firmware.requests().contains(&"modem.b00".to_string()));
}

#[test]
#[serial]
fn verification_failure_stops_loading() {
    let sim = init();
    let mdt = MdtBuilder::new(0x1000)
        .segment(0x1000, 0x1000, 0x100, PhdrFlags::READ, 0x1000)
        .segment(0x2000, 0x1000, 0x100, PhdrFlags::READ, 0x1000)
        .segment(0x3000, 0x1000, 0x100, PhdrFlags::READ, 0x1000)
        .build();
    sim.firmware.insert("modem.mdt", mdt);
    for n in 0..3 {
        sim.firmware.insert(format!("modem.b0{n}"), vec![0x10 + n as u8; 0x100]);
    }
    let verifier = DigestVerifier::new(sim.memory.clone());
    let mut first = vec![0x10u8; 0x100];
    first.resize(0x1000, 0);
    verifier.expect(0x1000, DigestVerifier::digest(&first));
    verifier.expect(0x2000, [0; 32]);
    let ops = SimOps::with_verifier(verifier);
    let desc = descriptor(&sim, &ops);

    let err = desc.boot().unwrap_err();
    assert_eq!(err.hook_stage(), Some(HookStage::VerifySegment(1)));
    assert!(!sim.firmware.requests().contains(&"modem.b02".to_string()));
    assert_eq!(ops.count("auth_and_reset"), 0);
    assert_eq!(ops.count("deinit_image"), 1);
    assert_eq!(ops.unvotes(), 1);
}

#[test]
#[serial]
fn hook_failures_report_their_stage() {
    let cases = [
        ("proxy_vote", HookStage::ProxyVote, 0),
        ("init_image", HookStage::InitImage, 0),
        ("mem_setup", HookStage::MemSetup, 1),
        ("auth_and_reset", HookStage::AuthAndReset, 1),
    ];
    for (hook, stage, deinits) in cases {
        let sim = init();
        mixed_image(&sim, 0x600);
        let ops = SimOps::new();
        ops.fail_at(hook);
        let desc = descriptor(&sim, &ops);

        let err = desc.boot().unwrap_err();
        assert_eq!(err.hook_stage(), Some(stage), "{hook}");
        assert_eq!(ops.count("deinit_image"), deinits, "{hook}");
        assert_eq!(sim.allocator.live(), 0, "{hook}");
        let expected_unvotes = usize::from(hook != "proxy_vote");
        assert_eq!(ops.unvotes(), expected_unvotes, "{hook}");
    }
}

#[test]
#[serial]
fn ramdump_lists_resident_segments() {
    let sim = init();
    mixed_image(&sim, 0x600);
    let ops = SimOps::new();
    let desc = descriptor(&sim, &ops);
    let device = SimRamdump::new();

    desc.boot().unwrap();
    desc.produce_ramdump(&device).unwrap();
    assert_eq!(
        device.captures(),
        vec![vec![
            RamdumpSegment { address: 0x1000, size: 0x1000 },
            RamdumpSegment { address: RELOC_BASE, size: 0x1000 },
        ]]
    );
    assert_eq!(desc.segment_count(), 2);

    device.fail_next();
    assert!(desc.produce_ramdump(&device).is_err());
    assert_eq!(desc.segment_count(), 2);

    desc.shutdown().unwrap();
    desc.produce_ramdump(&device).unwrap();
    assert_eq!(device.captures().last().unwrap(), &Vec::new());
}

#[test]
#[serial]
fn shutdown_before_boot_is_a_no_op() {
    let sim = init();
    let ops = SimOps::new();
    let desc = descriptor(&sim, &ops);
    desc.shutdown().unwrap();
    assert_eq!(desc.state(), BootState::Idle);
    assert!(ops.calls().is_empty());
}

#[test]
#[serial]
fn elf64_metadata_boots() {
    let sim = init();
    let mdt = MdtBuilder::new(0x4000)
        .elf64()
        .segment(0x4000, 0x2000, 0x800, PhdrFlags::READ | PhdrFlags::EXEC, 0x1000)
        .build();
    sim.firmware.insert("modem.mdt", mdt);
    sim.firmware.insert("modem.b00", vec![1; 0x800]);
    let ops = SimOps::new();
    let desc = descriptor(&sim, &ops);

    desc.boot().unwrap();
    assert_eq!(desc.entry_address(), 0x4000);
    assert_eq!(sim.allocator.alloc_calls(), 0);
}

#[test]
#[serial]
fn missing_metadata_is_not_found() {
    let sim = init();
    let ops = SimOps::new();
    let desc = descriptor(&sim, &ops);
    assert!(matches!(desc.boot(), Err(PilError::NotFound(_))));
    assert_eq!(desc.state(), BootState::Failed);
}
