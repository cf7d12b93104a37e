#![no_std]
#![no_main]

use bootloader_api::{entry_point, BootInfo};
use aegis_kernel::{arch, drivers, log_service, mm, println};

entry_point!(kernel_main);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    println!("kernel memory core booting");

    arch::init();
    log_service::log_init();

    mm::MemorySubsystem::init(&boot_info.memory_regions)
        .expect("memory subsystem init must run exactly once, before any fault can occur");
    println!(
        "mm: usable memory seen by bootloader: {} bytes",
        mm::memmap::total_usable(&boot_info.memory_regions)
    );

    drivers::init();

    println!("kernel initialized, entering idle loop");
    loop {
        arch::idle();
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("[KERNEL PANIC] {}", info);
    arch::halt();
}
