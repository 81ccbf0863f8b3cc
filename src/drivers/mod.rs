pub mod console;
pub mod keyboard;
pub mod pit;

pub fn init() {
    keyboard::init();
    console::init();
    pit::init();
    crate::log_info!("Drivers subsystem initialized.");
}
