//! End-to-end testable properties spanning CPU, PPU, bus, and mapper
//! together through the `Machine` facade.

use nescore::bus::ControllerState;
use nescore::{Machine, Mirroring, Rom, RomHeader};
use nescore_cpu::Bus;
use nescore_mappers::Nrom;

fn nop_rom(mirroring: Mirroring) -> Rom {
    let mut prg = vec![0xEAu8; 32768];
    prg[0x7FFC] = 0x00;
    prg[0x7FFD] = 0x80;
    Rom {
        header: RomHeader {
            prg_rom_size: prg.len(),
            chr_rom_size: 8192,
            mapper_number: 0,
            submapper: 0,
            mirroring,
            has_battery: false,
            has_trainer: false,
            nes2_format: false,
            prg_ram_size: 8192,
            prg_nvram_size: 0,
            chr_ram_size: 0,
            chr_nvram_size: 0,
        },
        prg_rom: prg,
        chr_rom: vec![0; 8192],
        trainer: None,
    }
}

fn machine_with_mirroring(mirroring: Mirroring) -> Machine {
    let rom = nop_rom(mirroring);
    Machine::with_mapper(Box::new(Nrom::new(&rom)))
}

#[test]
fn horizontal_nametable_mirror_pairs_match() {
    let mut machine = machine_with_mirroring(Mirroring::Horizontal);
    machine.reset();

    machine.bus_mut().write(0x2006, 0x20);
    machine.bus_mut().write(0x2006, 0x00);
    machine.bus_mut().write(0x2007, 0x2A);

    machine.bus_mut().write(0x2006, 0x24);
    machine.bus_mut().write(0x2006, 0x00);
    let dummy = machine.bus_mut().read(0x2007);
    let _ = dummy; // PPUDATA reads are buffered by one; prime the pipeline
    let readback = machine.bus_mut().read(0x2007);
    assert_eq!(readback, 0x2A);
}

#[test]
fn vertical_nametable_mirror_pairs_match() {
    let mut machine = machine_with_mirroring(Mirroring::Vertical);
    machine.reset();

    machine.bus_mut().write(0x2006, 0x28);
    machine.bus_mut().write(0x2006, 0x00);
    machine.bus_mut().write(0x2007, 0x55);

    machine.bus_mut().write(0x2006, 0x20);
    machine.bus_mut().write(0x2006, 0x00);
    let _ = machine.bus_mut().read(0x2007);
    let readback = machine.bus_mut().read(0x2007);
    assert_eq!(readback, 0x55);
}

#[test]
fn controller_latch_order_is_a_b_select_start_up_down_left_right() {
    let mut machine = machine_with_mirroring(Mirroring::Horizontal);
    machine.reset();

    machine.set_controller1(ControllerState {
        buttons: ControllerState::A | ControllerState::RIGHT,
    });

    machine.bus_mut().write(0x4016, 1);
    machine.bus_mut().write(0x4016, 0);

    let expected = [1u8, 0, 0, 0, 0, 0, 0, 1];
    for bit in expected {
        let value = machine.bus_mut().read(0x4016) & 0x01;
        assert_eq!(value, bit);
    }
}

#[test]
fn controller_read_while_strobe_held_high_always_returns_a() {
    let mut machine = machine_with_mirroring(Mirroring::Horizontal);
    machine.reset();

    machine.set_controller1(ControllerState {
        buttons: ControllerState::A | ControllerState::RIGHT,
    });

    // Hold strobe high (no following write of 0) and read repeatedly: every
    // read must return the constant A bit, never shifting to B/Select/...
    machine.bus_mut().write(0x4016, 1);
    for _ in 0..16 {
        let value = machine.bus_mut().read(0x4016) & 0x01;
        assert_eq!(value, 1);
    }

    machine.set_controller1(ControllerState {
        buttons: ControllerState::RIGHT,
    });
    for _ in 0..4 {
        let value = machine.bus_mut().read(0x4016) & 0x01;
        assert_eq!(value, 0);
    }
}

#[test]
fn oam_dma_copies_page_verbatim_with_wraparound() {
    let mut machine = machine_with_mirroring(Mirroring::Horizontal);
    machine.reset();

    for i in 0..256u16 {
        machine.bus_mut().write(0x0200 + i, i as u8);
    }
    // Start partway through OAM to exercise the wraparound.
    machine.bus_mut().write(0x2003, 0x80);
    machine.bus_mut().write(0x4014, 0x02);

    assert!(machine.bus_mut().oam_dma_pending());
    machine.bus_mut().execute_oam_dma();
    assert!(!machine.bus_mut().oam_dma_pending());

    for i in 0..256u16 {
        let oam_index = (0x80 + i) & 0xFF;
        machine.bus_mut().write(0x2003, oam_index as u8);
        assert_eq!(machine.bus_mut().read(0x2004), i as u8);
    }
}

#[test]
fn ppu_dot_advances_three_times_cpu_cycles() {
    let mut machine = machine_with_mirroring(Mirroring::Horizontal);
    machine.reset_to(0x8000);

    let mut total_cpu_cycles = 0u64;
    for _ in 0..50 {
        total_cpu_cycles += u64::from(machine.step().unwrap());
    }

    let ppu_dots = total_cpu_cycles * 3;
    let total_positions = u64::from(nescore_ppu::DOTS_PER_SCANLINE) * u64::from(nescore_ppu::SCANLINES_PER_FRAME);
    let expected_position = ppu_dots % total_positions;
    let expected_scanline = expected_position / u64::from(nescore_ppu::DOTS_PER_SCANLINE);
    let expected_dot = expected_position % u64::from(nescore_ppu::DOTS_PER_SCANLINE);

    assert_eq!(u64::from(machine.ppu().scanline()), expected_scanline);
    assert_eq!(u64::from(machine.ppu().dot()), expected_dot);
}

#[test]
fn invalid_address_access_stops_machine_and_is_observable() {
    let mut prg = vec![0xEAu8; 32768];
    // LDA #$00 ; STA $5000
    prg[0..5].copy_from_slice(&[0xA9, 0x00, 0x8D, 0x00, 0x50]);
    prg[0x7FFC] = 0x00;
    prg[0x7FFD] = 0x80;

    let rom = Rom {
        header: RomHeader {
            prg_rom_size: prg.len(),
            chr_rom_size: 8192,
            mapper_number: 0,
            submapper: 0,
            mirroring: Mirroring::Horizontal,
            has_battery: false,
            has_trainer: false,
            nes2_format: false,
            prg_ram_size: 8192,
            prg_nvram_size: 0,
            chr_ram_size: 0,
            chr_nvram_size: 0,
        },
        prg_rom: prg,
        chr_rom: vec![0; 8192],
        trainer: None,
    };
    let mut machine = Machine::with_mapper(Box::new(Nrom::new(&rom)));
    machine.reset_to(0x8000);

    machine.step().unwrap();
    let result = machine.step();
    assert!(result.is_err());
    assert!(!machine.is_running());
}
