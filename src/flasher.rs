//! The top-level orchestrator: identify what is currently running on a
//! module, enter the bootloader, upload a GBL image, and decide
//! whether a given image is even safe to flash onto it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const ENTER_BOOTLOADER_TIMEOUT: Duration = Duration::from_secs(2);

use crate::cpc::CpcClient;
use crate::error::{FlasherError, Result};
use crate::ezsp::EzspClient;
use crate::gbl::GblImage;
use crate::gecko_bootloader;
use crate::gpio::{drive_pattern, pattern_for, GpioDriver, ResetTarget};
use crate::metadata::{FwType, NabuCasaMetadata};
use crate::serial::Transport;
use crate::spinel::SpinelClient;
use crate::version::Version;
use crate::xmodem;

/// The kind of application a probe identified as currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplicationType {
    GeckoBootloader,
    Cpc,
    Ezsp,
    Spinel,
}

/// Maps a firmware image's declared type to the application protocol
/// that same image would speak once it is running.
#[must_use]
pub fn application_type_for(fw_type: FwType) -> ApplicationType {
    match fw_type {
        FwType::ZigbeeNcp => ApplicationType::Ezsp,
        FwType::OpenthreadRcp => ApplicationType::Spinel,
        FwType::ZwaveNcp => ApplicationType::Ezsp,
        FwType::Multipan => ApplicationType::Cpc,
        FwType::Bootloader | FwType::Unknown => ApplicationType::GeckoBootloader,
    }
}

/// The baudrate a freshly-flashed image of a given type is expected to
/// come up at, absent metadata saying otherwise.
#[must_use]
pub fn default_baudrate_for(fw_type: FwType) -> u32 {
    match fw_type {
        FwType::ZigbeeNcp | FwType::ZwaveNcp => 115_200,
        FwType::OpenthreadRcp => 460_800,
        FwType::Multipan => 460_800,
        FwType::Bootloader | FwType::Unknown => 115_200,
    }
}

/// An application identified as currently running, with its version.
#[derive(Debug, Clone)]
pub struct RunningApp {
    pub app_type: ApplicationType,
    pub version: Option<Version>,
}

type TransportFuture = Pin<Box<dyn Future<Output = Result<Transport>> + Send>>;

/// Opens a transport to the device at a given baudrate. Boxed so the
/// flasher can reopen the port at whatever baudrate each probe attempt
/// needs without hard-coding a single connection.
pub trait TransportFactory: Send + Sync {
    fn open(&self, baudrate: u32) -> TransportFuture;
}

impl<F> TransportFactory for F
where
    F: Fn(u32) -> TransportFuture + Send + Sync,
{
    fn open(&self, baudrate: u32) -> TransportFuture {
        (self)(baudrate)
    }
}

/// Options controlling whether [`Flasher::flash`] will proceed given a
/// mismatch between the firmware image and the currently-running app.
#[derive(Debug, Clone, Copy)]
pub struct FlashOptions {
    /// Allow flashing an image whose `fw_type` differs from the
    /// currently-running application's type.
    pub allow_cross_flashing: bool,
    /// Require exact version equality for the "already installed"
    /// short-circuit; without this, any version compatible with the
    /// running one (a shared comparable prefix) counts as installed.
    pub ensure_exact_version: bool,
    /// Without this, an apparent downgrade is silently skipped rather
    /// than flashed.
    pub allow_downgrades: bool,
    /// Skip every compatibility check and flash unconditionally.
    pub force: bool,
    /// Consecutive per-block XMODEM retry budget.
    pub max_failures: u32,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            allow_cross_flashing: false,
            ensure_exact_version: false,
            allow_downgrades: false,
            force: false,
            max_failures: 3,
        }
    }
}

/// Orchestrates probing, bootloader entry, and firmware upload for one
/// radio co-processor module.
pub struct Flasher<O> {
    open: O,
    probe_order: Vec<ApplicationType>,
    preferred_baudrate: HashMap<ApplicationType, u32>,
    bootloader_baudrate: u32,
    last_known: Option<RunningApp>,
}

impl<O> Flasher<O>
where
    O: TransportFactory,
{
    pub fn new(open: O, bootloader_baudrate: u32) -> Self {
        Self {
            open,
            probe_order: vec![
                ApplicationType::GeckoBootloader,
                ApplicationType::Cpc,
                ApplicationType::Ezsp,
                ApplicationType::Spinel,
            ],
            preferred_baudrate: HashMap::new(),
            bootloader_baudrate,
            last_known: None,
        }
    }

    /// Biases the next `probe_app_type` sweep toward the application
    /// type (and baud rate) a firmware image's metadata declares, so
    /// re-flashing the same kind of image it is replacing does not pay
    /// for trying every other protocol first. Call this with the
    /// target image's metadata before `probe_app_type`, not after —
    /// `flash` receives `running` already resolved, too late to bias
    /// the sweep that produced it.
    pub fn prefer_image(&mut self, fw_type: Option<FwType>, baudrate: Option<u32>) {
        let Some(fw_type) = fw_type else { return };
        let expected = application_type_for(fw_type);

        self.probe_order.sort_by_key(|&method| match method {
            ApplicationType::GeckoBootloader => 0,
            m if m == expected => 1,
            _ => 2,
        });

        if let Some(baud) = baudrate {
            self.preferred_baudrate.insert(expected, baud);
        }
    }

    /// The baud rates to try for `app_type`, in the order a fresh probe
    /// should attempt them. A baud rate set via `prefer_image` is tried
    /// first.
    fn baudrates_for(&self, app_type: ApplicationType) -> Vec<u32> {
        let mut bauds = match app_type {
            ApplicationType::GeckoBootloader => vec![self.bootloader_baudrate],
            ApplicationType::Cpc => vec![460_800, 115_200, 230_400],
            ApplicationType::Ezsp => vec![115_200],
            ApplicationType::Spinel => vec![460_800],
        };

        if let Some(&preferred) = self.preferred_baudrate.get(&app_type) {
            bauds.retain(|&b| b != preferred);
            bauds.insert(0, preferred);
        }

        bauds
    }

    /// Walks the Cartesian product of `probe_order` x each method's
    /// baud-rate list, opening a fresh connection per `(method, baud)`
    /// pair, until one reports a running application.
    ///
    /// `yellow_gpio_reset` and `sonoff_reset` drive a hardware reset
    /// before probing starts; if the whole sweep comes up empty and a
    /// reset was requested, the reset is re-asserted and the bootloader
    /// is re-probed once as a last resort, since a board that needed a
    /// hardware nudge may not have been listening for the first sweep.
    ///
    /// A probe failure never clears previously-learned state: only a
    /// successful probe updates `last_known`.
    pub async fn probe_app_type(
        &mut self,
        yellow_gpio_reset: Option<&mut dyn GpioDriver>,
        sonoff_reset: bool,
    ) -> Result<RunningApp> {
        let reset_requested = yellow_gpio_reset.is_some() || sonoff_reset;

        if let Some(driver) = yellow_gpio_reset {
            drive_pattern(driver, pattern_for(ResetTarget::Yellow)).await?;
        }
        if sonoff_reset {
            let mut transport = self.open.open(self.bootloader_baudrate).await?;
            transport.sonoff_reset_sequence().await?;
        }

        if let Some(app) = self.probe_sweep().await? {
            return Ok(app);
        }

        if reset_requested {
            if let Some((version, baud)) = self.last_seen_bootloader(self.bootloader_baudrate).await {
                self.bootloader_baudrate = baud;
                let app = RunningApp {
                    app_type: ApplicationType::GeckoBootloader,
                    version: Some(version),
                };
                self.last_known = Some(app.clone());
                return Ok(app);
            }
        }

        Err(FlasherError::NoRunningApp)
    }

    /// One pass over every `(method, baud)` pair. Returns `Ok(Some(_))`
    /// on a match, `Ok(None)` if the sweep was exhausted cleanly.
    async fn probe_sweep(&mut self) -> Result<Option<RunningApp>> {
        let mut bootloader_probed = false;

        for method in self.probe_order.clone() {
            for baud in self.baudrates_for(method) {
                if method == ApplicationType::GeckoBootloader && bootloader_probed {
                    continue;
                }

                let mut transport = match self.open.open(baud).await {
                    Ok(t) => t,
                    Err(_) => continue,
                };

                if method == ApplicationType::GeckoBootloader {
                    let banner = match gecko_bootloader::probe(&mut transport).await {
                        Ok(b) => b,
                        Err(_) => continue,
                    };
                    bootloader_probed = true;

                    // A banner with no firmware to run is a terminal
                    // identification; one that does launch an
                    // application, so the rest of the sweep continues.
                    match gecko_bootloader::run_firmware(&mut transport).await {
                        Err(FlasherError::NoFirmware) => {
                            self.bootloader_baudrate = baud;
                            let app = RunningApp {
                                app_type: ApplicationType::GeckoBootloader,
                                version: Some(banner.version),
                            };
                            self.last_known = Some(app.clone());
                            return Ok(Some(app));
                        }
                        _ => continue,
                    }
                }

                let version = match method {
                    ApplicationType::Cpc => {
                        let mut client = CpcClient::new(transport);
                        client.probe().await.ok()
                    }
                    ApplicationType::Spinel => {
                        let mut client = SpinelClient::new(transport);
                        client.probe().await.ok()
                    }
                    ApplicationType::Ezsp | ApplicationType::GeckoBootloader => None,
                };

                if let Some(version) = version {
                    let app = RunningApp {
                        app_type: method,
                        version: Some(version),
                    };
                    self.last_known = Some(app.clone());
                    return Ok(Some(app));
                }
            }
        }

        Ok(None)
    }

    /// Last-resort bootloader re-probe used only after a hardware reset
    /// and an otherwise-empty sweep.
    async fn last_seen_bootloader(&self, baud: u32) -> Option<(Version, u32)> {
        let mut transport = self.open.open(baud).await.ok()?;
        let banner = gecko_bootloader::probe(&mut transport).await.ok()?;
        Some((banner.version, baud))
    }

    /// Probes an already-connected EZSP session, since its transport
    /// (ASH over UART, or SPI) is outside this crate's scope.
    pub async fn probe_ezsp(&mut self, ezsp: &mut impl EzspClient) -> Result<RunningApp> {
        let version = ezsp.get_version().await?;
        let app = RunningApp {
            app_type: ApplicationType::Ezsp,
            version: Some(version),
        };
        self.last_known = Some(app.clone());
        Ok(app)
    }

    /// Drives whichever protocol `running` speaks into the bootloader.
    pub async fn enter_bootloader(
        &self,
        running: &RunningApp,
        ezsp: Option<&mut impl EzspClient>,
    ) -> Result<()> {
        match running.app_type {
            ApplicationType::GeckoBootloader => Ok(()),
            ApplicationType::Cpc => {
                let transport = self.open.open(self.baudrates_for(ApplicationType::Cpc)[0]).await?;
                let mut client = CpcClient::new(transport);
                tokio::time::timeout(ENTER_BOOTLOADER_TIMEOUT, client.enter_bootloader())
                    .await
                    .map_err(|_| FlasherError::Timeout)?
            }
            ApplicationType::Spinel => {
                let transport = self
                    .open
                    .open(self.baudrates_for(ApplicationType::Spinel)[0])
                    .await?;
                let mut client = SpinelClient::new(transport);
                tokio::time::timeout(ENTER_BOOTLOADER_TIMEOUT, client.enter_bootloader())
                    .await
                    .map_err(|_| FlasherError::Timeout)?
            }
            ApplicationType::Ezsp => {
                let ezsp = ezsp.ok_or_else(|| {
                    FlasherError::InvalidArgument(
                        "entering the bootloader from EZSP requires a connected EzspClient".to_string(),
                    )
                })?;
                // EZSP is expected to go silent once the bootloader
                // launch command lands; a timeout here means success.
                match ezsp.launch_standalone_bootloader().await {
                    Ok(()) | Err(FlasherError::Timeout) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Uploads `image` bytes to a module already sitting at the
    /// bootloader menu, padding to the XMODEM block size, then
    /// launches the new firmware.
    pub async fn flash_firmware(
        &self,
        image: &[u8],
        options: FlashOptions,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<()> {
        let padded = crate::crc::pad_to_multiple(image, xmodem::BLOCK_SIZE, &[0xFF])?;

        let mut transport = self.open.open(self.bootloader_baudrate).await?;
        gecko_bootloader::probe(&mut transport).await?;
        gecko_bootloader::upload_firmware(&mut transport, &padded, options.max_failures, &mut progress)
            .await?;

        match gecko_bootloader::run_firmware(&mut transport).await {
            Ok(()) | Err(FlasherError::NoFirmware) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Decides whether `metadata` may be flashed given `running`, and
    /// uploads it if so. This is the policy gate: cross-flash
    /// detection, already-installed/downgrade short-circuits, and the
    /// `force`/`allow_*` escape hatches all live here. A short-circuit
    /// is a silent success, not an error: only a type mismatch without
    /// `allow_cross_flashing` fails outright.
    pub async fn flash(
        &mut self,
        image: &[u8],
        metadata: Option<&NabuCasaMetadata>,
        running: Option<&RunningApp>,
        options: FlashOptions,
        progress: impl FnMut(usize, usize),
    ) -> Result<()> {
        if !options.force {
            if let (Some(metadata), Some(running)) = (metadata, running) {
                if !self.should_flash(metadata, running, &options)? {
                    return Ok(());
                }
            }
        }

        self.flash_firmware(image, options, progress).await
    }

    fn should_flash(
        &self,
        metadata: &NabuCasaMetadata,
        running: &RunningApp,
        options: &FlashOptions,
    ) -> Result<bool> {
        if let Some(fw_type) = metadata.fw_type {
            let image_app_type = application_type_for(fw_type);

            if image_app_type != running.app_type
                && running.app_type != ApplicationType::GeckoBootloader
                && !options.allow_cross_flashing
            {
                return Err(FlasherError::CrossFlash(format!(
                    "image is {image_app_type:?} but {:?} is currently running",
                    running.app_type
                )));
            }
        }

        if let (Some(image_version), Some(running_version)) =
            (metadata.public_version(), running.version.as_ref())
        {
            let already_installed = if options.ensure_exact_version {
                running_version == image_version
            } else {
                running_version.compatible_with(image_version)
            };

            if already_installed {
                return Ok(false);
            }

            if running_version > image_version && !options.allow_downgrades {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

/// Parses `data` as a GBL image and returns its embedded NabuCasa
/// metadata, if present.
pub fn read_gbl_metadata(data: &[u8]) -> Result<NabuCasaMetadata> {
    GblImage::parse(data)?.get_nabucasa_metadata()
}

/// The complete default-baudrate table, keyed by firmware type.
#[must_use]
pub fn default_baudrates() -> HashMap<FwType, u32> {
    use strum::IntoEnumIterator;
    FwType::iter().map(|t| (t, default_baudrate_for(t))).collect()
}
