#![no_std]
#![no_main]

use core::net::Ipv4Addr;

use esp_hal::analog::adc::{Adc, AdcConfig, Attenuation};
use esp_hal::clock::CpuClock;
use esp_hal::delay::Delay;
use esp_hal::gpio::{DriveMode, Flex, Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::rng::Rng;
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::Blocking;
use esp_println::println;

extern crate alloc;

use esp_wifi::wifi::{self, WifiController};

use embassy_net::tcp::TcpSocket;
use embassy_net::{Config, Stack, StackResources};
use embassy_time::{Duration, Instant, Timer};
use esp_hal_embassy::Executor;
use log::{error, info, warn};
use ssd1306::mode::BufferedGraphicsMode;
use ssd1306::prelude::*;
use ssd1306::{I2CDisplayInterface, Ssd1306};
use static_cell::StaticCell;

use envmon_board::clock::{self, WallClock};
use envmon_board::config;
use envmon_board::dht::Dht11;
use envmon_board::hardware::{Buzzer, HwRng, LightAdc};
use envmon_board::monitor::{Devices, Monitor};
use envmon_board::snapshot::{self, TestPattern};
use envmon_board::state_machine::SessionConfig;
use envmon_board::traits::StatusDisplay;
use envmon_board::wifi::WifiLink;
use envmon_board::ws::{CLIENT_FRAME_LEN, WsClient, WsEndpoint};

// Add app descriptor for espflash compatibility
esp_bootloader_esp_idf::esp_app_desc!();

type Display = Ssd1306<
    I2CInterface<I2c<'static, Blocking>>,
    DisplaySize128x64,
    BufferedGraphicsMode<DisplaySize128x64>,
>;
type BoardDevices = Devices<Dht11<Flex<'static>, Delay>, LightAdc<'static>, Buzzer<Output<'static>>, Display>;

/// Camera stand-in geometry (80x60 grayscale)
const PATTERN_WIDTH: u16 = 80;
const PATTERN_HEIGHT: u16 = 60;
const PATTERN_LEN: usize = PATTERN_WIDTH as usize * PATTERN_HEIGHT as usize;

// Static cells for embassy components
static WIFI_INIT_CELL: StaticCell<esp_wifi::EspWifiController<'static>> = StaticCell::new();
static STACK_RESOURCES: StaticCell<StackResources<4>> = StaticCell::new();
static WS_RX_BUFFER: StaticCell<[u8; 1024]> = StaticCell::new();
static WS_TX_BUFFER: StaticCell<[u8; CLIENT_FRAME_LEN * 2]> = StaticCell::new();
static PATTERN_CELL: StaticCell<TestPattern<PATTERN_LEN>> = StaticCell::new();

// Static executor for embassy tasks
static EXECUTOR: StaticCell<Executor> = StaticCell::new();

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("[MAIN] Panic: {}", info);
    loop {}
}

/// Park the firmware after an unrecoverable boot failure
fn halt(reason: &str) -> ! {
    println!("[MAIN] Halted: {}", reason);
    loop {
        core::hint::spin_loop();
    }
}

async fn halt_async(reason: &str) -> ! {
    error!("[MAIN] Halted: {}", reason);
    loop {
        Timer::after(Duration::from_secs(1)).await;
    }
}

// Embassy task to run the network stack
#[embassy_executor::task]
async fn net_task(
    mut runner: embassy_net::Runner<'static, esp_wifi::wifi::WifiDevice<'static>>,
) -> ! {
    runner.run().await
}

/// Camera snapshot server background task
#[embassy_executor::task]
async fn camera_task(stack: Stack<'static>, source: &'static mut TestPattern<PATTERN_LEN>) -> ! {
    stack.wait_config_up().await;
    snapshot::serve(stack, config::CAMERA_PORT, source).await
}

/// Boot sequence followed by the monitor poll loop
#[embassy_executor::task]
async fn monitor_task(
    controller: WifiController<'static>,
    stack: Stack<'static>,
    mut devices: BoardDevices,
    button: Input<'static>,
    rng: HwRng,
) -> ! {
    let _ = devices.display.show_message(&["Connecting WiFi..."]);

    let mut link = WifiLink::new(controller, stack);
    let timeout = Duration::from_millis(config::WIFI_CONNECT_TIMEOUT_MS);
    let ip = match link
        .associate(config::WIFI_SSID, config::WIFI_PASSWORD, timeout)
        .await
    {
        Ok(ip) => ip,
        Err(_) => {
            let _ = devices.display.show_message(&["WiFi Failed!"]);
            halt_async("WiFi association failed").await
        }
    };

    let mut ip_line = heapless::String::<24>::new();
    let _ = core::fmt::write(
        &mut ip_line,
        format_args!("{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]),
    );
    let _ = devices
        .display
        .show_message(&["WiFi Connected", ip_line.as_str()]);

    let mut wall_clock = WallClock::new(config::GMT_OFFSET_SECS);
    match config::NTP_SERVER.parse::<Ipv4Addr>() {
        Ok(server) => match clock::sync_via_sntp(stack, server).await {
            Ok(unix) => wall_clock.synchronize(unix, Instant::now()),
            Err(_) => warn!("[NTP] Continuing without wall clock"),
        },
        Err(_) => warn!("[NTP] NTP_SERVER is not an IPv4 address: {}", config::NTP_SERVER),
    }

    let endpoint = match WsEndpoint::from_config() {
        Ok(endpoint) => endpoint,
        Err(_) => {
            let _ = devices.display.show_message(&["WS host invalid"]);
            halt_async("WS_HOST must be an IPv4 address").await
        }
    };

    let socket = TcpSocket::new(
        stack,
        WS_RX_BUFFER.init([0; 1024]),
        WS_TX_BUFFER.init([0; CLIENT_FRAME_LEN * 2]),
    );
    let transport = WsClient::new(socket, rng, endpoint);

    let session = SessionConfig {
        autostart: config::AUTOSTART,
        ..SessionConfig::default()
    };
    let mut monitor = Monitor::new(
        session,
        transport,
        link,
        devices,
        wall_clock,
    );
    monitor.boot(Instant::now()).await;
    info!("[MAIN] Monitor ready");

    let poll = Duration::from_millis(config::POLL_INTERVAL_MS);
    loop {
        // Active-low with pull-up
        monitor.step(Instant::now(), button.is_low()).await;
        Timer::after(poll).await;
    }
}

#[esp_hal::main]
fn main() -> ! {
    esp_println::logger::init_logger_from_env();
    println!("[MAIN] envmon-board {}", envmon_board::VERSION);

    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);

    // Initialize heap allocator for WiFi (72KB)
    esp_alloc::heap_allocator!(size: 72 * 1024);

    // Initialize embassy time system
    let timer_group0 = TimerGroup::new(peripherals.TIMG0);
    esp_hal_embassy::init(timer_group0.timer0);

    // Status display on I2C0, SDA GPIO5 and SCL GPIO6
    println!("[DISPLAY] SSD1306 at 0x{:02X}", config::DISPLAY_I2C_ADDRESS);
    let i2c = match I2c::new(
        peripherals.I2C0,
        I2cConfig::default().with_frequency(Rate::from_khz(400)),
    ) {
        Ok(i2c) => i2c
            .with_sda(peripherals.GPIO5)
            .with_scl(peripherals.GPIO6),
        Err(_) => halt("I2C configuration rejected"),
    };
    let mut display = Ssd1306::new(
        I2CDisplayInterface::new_custom_address(i2c, config::DISPLAY_I2C_ADDRESS),
        DisplaySize128x64,
        DisplayRotation::Rotate0,
    )
    .into_buffered_graphics_mode();
    if display.init().is_err() {
        println!("[DISPLAY] SSD1306 not responding, continuing headless");
    }
    let _ = display.show_message(&["Booting..."]);

    // Initialize WiFi driver
    let timer_group1 = TimerGroup::new(peripherals.TIMG1);
    let mut rng = Rng::new(peripherals.RNG);
    let wifi_init = match esp_wifi::init(timer_group1.timer0, rng, peripherals.RADIO_CLK) {
        Ok(init) => init,
        Err(e) => {
            println!("[WIFI] Driver init failed: {:?}", e);
            let _ = display.show_message(&["WiFi Failed!"]);
            halt("WiFi driver init failed")
        }
    };
    let wifi_init_ref = WIFI_INIT_CELL.init(wifi_init);

    let (wifi_controller, wifi_interfaces) = match wifi::new(wifi_init_ref, peripherals.WIFI) {
        Ok(pair) => pair,
        Err(e) => {
            println!("[WIFI] Controller creation failed: {:?}", e);
            let _ = display.show_message(&["WiFi Failed!"]);
            halt("WiFi controller creation failed")
        }
    };

    // Create embassy-net stack with DHCP configuration
    let net_config = Config::dhcpv4(Default::default());
    let seed = (rng.random() as u64) << 32 | rng.random() as u64;
    let (stack, runner) = embassy_net::new(
        wifi_interfaces.sta,
        net_config,
        STACK_RESOURCES.init(StackResources::new()),
        seed,
    );

    // DHT11 data line on GPIO4: open drain with pull-up, read back through the same pin
    let mut dht_pin = Flex::new(peripherals.GPIO4);
    dht_pin.apply_output_config(
        &OutputConfig::default()
            .with_drive_mode(DriveMode::OpenDrain)
            .with_pull(Pull::Up),
    );
    dht_pin.set_level(Level::High);
    dht_pin.set_output_enable(true);
    dht_pin.set_input_enable(true);

    // Light sensor on GPIO2
    let mut adc_config = AdcConfig::new();
    let light_pin = adc_config.enable_pin(peripherals.GPIO2, Attenuation::_11dB);
    let adc = Adc::new(peripherals.ADC1, adc_config);

    let buzzer_pin = Output::new(peripherals.GPIO10, Level::Low, OutputConfig::default());
    // Active-low button
    let button = Input::new(peripherals.GPIO9, InputConfig::default().with_pull(Pull::Up));

    let devices = Devices {
        climate: Dht11::new(dht_pin, Delay::new()),
        light: LightAdc::new(adc, light_pin),
        alarm: Buzzer::new(buzzer_pin),
        display,
    };

    let pattern = match TestPattern::new(PATTERN_WIDTH, PATTERN_HEIGHT) {
        Ok(pattern) => PATTERN_CELL.init(pattern),
        Err(_) => halt("Test pattern geometry mismatch"),
    };

    // Initialize embassy executor and run tasks
    let executor = EXECUTOR.init(Executor::new());
    executor.run(|spawner| {
        println!("[MAIN] Spawning network task...");
        spawner.spawn(net_task(runner)).ok();

        println!("[MAIN] Spawning monitor task...");
        if let Err(e) = spawner.spawn(monitor_task(
            wifi_controller,
            stack,
            devices,
            button,
            HwRng::new(rng),
        )) {
            println!("[MAIN] Failed to spawn monitor task: {:?}", e);
        }

        println!("[MAIN] Spawning camera task...");
        if let Err(e) = spawner.spawn(camera_task(stack, pattern)) {
            println!("[MAIN] Failed to spawn camera task: {:?}", e);
        }
    });
}
