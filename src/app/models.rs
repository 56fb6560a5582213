use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Outcome of one executed command line. `text` holds merged stdout/stderr and is kept even when
/// the command failed, so callers can match tool-specific error strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    pub text: String,
    pub succeeded: bool,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn timed_out(command_line: &str, timeout_secs: u64) -> Self {
        Self {
            text: format!("Command '{command_line}' timed out after {timeout_secs} seconds"),
            succeeded: false,
            timed_out: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSummary {
    pub serial: String,
    pub state: String,
    pub model: Option<String>,
    pub product: Option<String>,
    pub device: Option<String>,
    pub transport_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial: String,
    pub os_type: String,
    pub os_version: String,
    pub sdk_version: String,
    pub brand: String,
    pub model: String,
    pub rom_version: String,
    pub cpu_abi: String,
    pub cpu_hardware: String,
    pub display: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: i32,
    pub ppid: i32,
    pub uid: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForegroundApp {
    pub package: String,
    pub activity: String,
    pub pid: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageCpu {
    pub package: String,
    pub pid: Option<i32>,
    pub uid: Option<String>,
    /// CPU% of the first process row whose name equals `package`.
    pub process_cpu_percent: Option<f64>,
    /// Sum of CPU% across every row sharing the resolved uid.
    pub uid_cpu_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuSample {
    pub timestamp_taken: DateTime<Local>,
    pub per_process: Vec<PackageCpu>,
    pub device_user_percent: f64,
    pub device_system_percent: f64,
    pub device_nice_percent: f64,
    pub device_idle_percent: f64,
    pub device_io_wait_percent: f64,
    pub device_irq_percent: f64,
    /// user% + system%.
    pub device_cpu_percent: f64,
    pub total_process_cpu_percent: f64,
}

impl CpuSample {
    /// Share of the whole device taken by the sampled packages, scaled against `idle + device`
    /// so multi-core totals (e.g. `400%cpu`) normalise to 100.
    pub fn app_cpu_share_percent(&self) -> Option<f64> {
        let capacity = self.device_idle_percent + self.device_cpu_percent;
        if capacity <= 0.0 {
            return None;
        }
        Some(round2(self.total_process_cpu_percent / capacity * 100.0))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemorySample {
    pub pid: i32,
    pub process_name: String,
    pub total_pss_mb: f64,
    pub java_heap_mb: f64,
    pub native_heap_mb: f64,
    pub system_mb: f64,
    pub total_alloc_heap_mb: f64,
}

/// Package metadata as reported by the external resolver. Never derived from raw package bytes here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppInfo {
    pub app_id: String,
    pub version: String,
    pub name: String,
    pub bundle_version: String,
    pub main_activity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    DeviceOffline,
    ArtifactUnavailable(String),
    Tool(InstallErrorCode),
}

impl FailureReason {
    pub fn description(&self) -> String {
        match self {
            FailureReason::DeviceOffline => "Device is offline".to_string(),
            FailureReason::ArtifactUnavailable(detail) => {
                format!("Package artifact unavailable: {detail}")
            }
            FailureReason::Tool(code) => code.description().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum InstallStatus {
    Success,
    Failure(FailureReason),
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallOutcome {
    pub app_info: AppInfo,
    pub status: InstallStatus,
    pub raw_output: String,
    pub attempts: u8,
}

impl InstallOutcome {
    pub fn is_success(&self) -> bool {
        self.status == InstallStatus::Success
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum UninstallStatus {
    Success,
    NotInstalled,
    Offline,
    TimedOut,
    Failure(String),
}

/// What the install state machine does after a tool reports a given error token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    TreatAsSuccess,
    SilentReinstall,
    ForceReinstall,
    Terminal,
    Report,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstallErrorCode {
    AlreadyExists,
    DevicesNotFound,
    DeviceOffline,
    InvalidApk,
    InvalidUri,
    InsufficientStorage,
    DuplicatePackage,
    NoSharedUser,
    UpdateIncompatible,
    SharedUserIncompatible,
    MissingSharedLibrary,
    ReplaceCouldntDelete,
    Dexopt,
    DeviceNoSpace,
    DeviceCopyFailed,
    OlderSdk,
    ConflictingProvider,
    NewerSdk,
    TestOnly,
    CpuAbiIncompatible,
    MissingFeature,
    ContainerError,
    InvalidInstallLocation,
    MediaUnavailable,
    VerificationTimeout,
    VerificationFailure,
    AcwfIncompatible,
    DuplicatePermission,
    PackageChanged,
    PermissionModelDowngrade,
    InternalError,
    InvalidZipFile,
    UidChanged,
    NoMatchingAbis,
    VersionDowngrade,
    UserRestricted,
    Aborted,
    CanceledByUser,
    CancelledByUser,
    ParseNoCertificates,
    ParseManifestEmpty,
    ParseManifestMalformed,
    ParseBadSharedUserId,
    ParseBadPackageName,
    ParseCertificateEncoding,
    ParseUnexpectedException,
    ParseInconsistentCertificates,
    ParseNotApk,
    ParseBadManifest,
    PasswordRequired,
    Unknown(String),
}

const KNOWN_CODES: [InstallErrorCode; 49] = [
    InstallErrorCode::AlreadyExists,
    InstallErrorCode::DevicesNotFound,
    InstallErrorCode::DeviceOffline,
    InstallErrorCode::InvalidApk,
    InstallErrorCode::InvalidUri,
    InstallErrorCode::InsufficientStorage,
    InstallErrorCode::DuplicatePackage,
    InstallErrorCode::NoSharedUser,
    InstallErrorCode::UpdateIncompatible,
    InstallErrorCode::SharedUserIncompatible,
    InstallErrorCode::MissingSharedLibrary,
    InstallErrorCode::ReplaceCouldntDelete,
    InstallErrorCode::Dexopt,
    InstallErrorCode::DeviceNoSpace,
    InstallErrorCode::DeviceCopyFailed,
    InstallErrorCode::OlderSdk,
    InstallErrorCode::ConflictingProvider,
    InstallErrorCode::NewerSdk,
    InstallErrorCode::TestOnly,
    InstallErrorCode::CpuAbiIncompatible,
    InstallErrorCode::MissingFeature,
    InstallErrorCode::ContainerError,
    InstallErrorCode::InvalidInstallLocation,
    InstallErrorCode::MediaUnavailable,
    InstallErrorCode::VerificationTimeout,
    InstallErrorCode::VerificationFailure,
    InstallErrorCode::AcwfIncompatible,
    InstallErrorCode::DuplicatePermission,
    InstallErrorCode::PackageChanged,
    InstallErrorCode::PermissionModelDowngrade,
    InstallErrorCode::InternalError,
    InstallErrorCode::InvalidZipFile,
    InstallErrorCode::UidChanged,
    InstallErrorCode::NoMatchingAbis,
    InstallErrorCode::VersionDowngrade,
    InstallErrorCode::UserRestricted,
    InstallErrorCode::Aborted,
    InstallErrorCode::CanceledByUser,
    InstallErrorCode::CancelledByUser,
    InstallErrorCode::ParseNoCertificates,
    InstallErrorCode::ParseManifestEmpty,
    InstallErrorCode::ParseManifestMalformed,
    InstallErrorCode::ParseBadSharedUserId,
    InstallErrorCode::ParseBadPackageName,
    InstallErrorCode::ParseCertificateEncoding,
    InstallErrorCode::ParseUnexpectedException,
    InstallErrorCode::ParseInconsistentCertificates,
    InstallErrorCode::ParseNotApk,
    InstallErrorCode::ParseBadManifest,
];

const PASSWORD_TOKENS: [&str; 2] = ["-99", "-200"];

impl InstallErrorCode {
    pub fn token(&self) -> &str {
        match self {
            InstallErrorCode::AlreadyExists => "INSTALL_FAILED_ALREADY_EXISTS",
            InstallErrorCode::DevicesNotFound => "INSTALL_DEVICES_NOT_FOUND",
            InstallErrorCode::DeviceOffline => "INSTALL_FAILED_DEVICE_OFFLINE",
            InstallErrorCode::InvalidApk => "INSTALL_FAILED_INVALID_APK",
            InstallErrorCode::InvalidUri => "INSTALL_FAILED_INVALID_URI",
            InstallErrorCode::InsufficientStorage => "INSTALL_FAILED_INSUFFICIENT_STORAGE",
            InstallErrorCode::DuplicatePackage => "INSTALL_FAILED_DUPLICATE_PACKAGE",
            InstallErrorCode::NoSharedUser => "INSTALL_FAILED_NO_SHARED_USER",
            InstallErrorCode::UpdateIncompatible => "INSTALL_FAILED_UPDATE_INCOMPATIBLE",
            InstallErrorCode::SharedUserIncompatible => "INSTALL_FAILED_SHARED_USER_INCOMPATIBLE",
            InstallErrorCode::MissingSharedLibrary => "INSTALL_FAILED_MISSING_SHARED_LIBRARY",
            InstallErrorCode::ReplaceCouldntDelete => "INSTALL_FAILED_REPLACE_COULDNT_DELETE",
            InstallErrorCode::Dexopt => "INSTALL_FAILED_DEXOPT",
            InstallErrorCode::DeviceNoSpace => "INSTALL_FAILED_DEVICE_NOSPACE",
            InstallErrorCode::DeviceCopyFailed => "INSTALL_FAILED_DEVICE_COPY_FAILED",
            InstallErrorCode::OlderSdk => "INSTALL_FAILED_OLDER_SDK",
            InstallErrorCode::ConflictingProvider => "INSTALL_FAILED_CONFLICTING_PROVIDER",
            InstallErrorCode::NewerSdk => "INSTALL_FAILED_NEWER_SDK",
            InstallErrorCode::TestOnly => "INSTALL_FAILED_TEST_ONLY",
            InstallErrorCode::CpuAbiIncompatible => "INSTALL_FAILED_CPU_ABI_INCOMPATIBLE",
            InstallErrorCode::MissingFeature => "INSTALL_FAILED_MISSING_FEATURE",
            InstallErrorCode::ContainerError => "INSTALL_FAILED_CONTAINER_ERROR",
            InstallErrorCode::InvalidInstallLocation => "INSTALL_FAILED_INVALID_INSTALL_LOCATION",
            InstallErrorCode::MediaUnavailable => "INSTALL_FAILED_MEDIA_UNAVAILABLE",
            InstallErrorCode::VerificationTimeout => "INSTALL_FAILED_VERIFICATION_TIMEOUT",
            InstallErrorCode::VerificationFailure => "INSTALL_FAILED_VERIFICATION_FAILURE",
            InstallErrorCode::AcwfIncompatible => "INSTALL_FAILED_ACWF_INCOMPATIBLE",
            InstallErrorCode::DuplicatePermission => "INSTALL_FAILED_DUPLICATE_PERMISSION",
            InstallErrorCode::PackageChanged => "INSTALL_FAILED_PACKAGE_CHANGED",
            InstallErrorCode::PermissionModelDowngrade => {
                "INSTALL_FAILED_PERMISSION_MODEL_DOWNGRADE"
            }
            InstallErrorCode::InternalError => "INSTALL_FAILED_INTERNAL_ERROR",
            InstallErrorCode::InvalidZipFile => "INSTALL_FAILED_INVALID_ZIP_FILE",
            InstallErrorCode::UidChanged => "INSTALL_FAILED_UID_CHANGED",
            InstallErrorCode::NoMatchingAbis => "INSTALL_FAILED_NO_MATCHING_ABIS",
            InstallErrorCode::VersionDowngrade => "INSTALL_FAILED_VERSION_DOWNGRADE",
            InstallErrorCode::UserRestricted => "INSTALL_FAILED_USER_RESTRICTED",
            InstallErrorCode::Aborted => "INSTALL_FAILED_ABORTED",
            InstallErrorCode::CanceledByUser => "INSTALL_CANCELED_BY_USER",
            InstallErrorCode::CancelledByUser => "INSTALL_FAILED_CANCELLED_BY_USER",
            InstallErrorCode::ParseNoCertificates => "INSTALL_PARSE_FAILED_NO_CERTIFICATES",
            InstallErrorCode::ParseManifestEmpty => "INSTALL_PARSE_FAILED_MANIFEST_EMPTY",
            InstallErrorCode::ParseManifestMalformed => "INSTALL_PARSE_FAILED_MANIFEST_MALFORMED",
            InstallErrorCode::ParseBadSharedUserId => "INSTALL_PARSE_FAILED_BAD_SHARED_USER_ID",
            InstallErrorCode::ParseBadPackageName => "INSTALL_PARSE_FAILED_BAD_PACKAGE_NAME",
            InstallErrorCode::ParseCertificateEncoding => {
                "INSTALL_PARSE_FAILED_CERTIFICATE_ENCODING"
            }
            InstallErrorCode::ParseUnexpectedException => {
                "INSTALL_PARSE_FAILED_UNEXPECTED_EXCEPTION"
            }
            InstallErrorCode::ParseInconsistentCertificates => {
                "INSTALL_PARSE_FAILED_INCONSISTENT_CERTIFICATES"
            }
            InstallErrorCode::ParseNotApk => "INSTALL_PARSE_FAILED_NOT_APK",
            InstallErrorCode::ParseBadManifest => "INSTALL_PARSE_FAILED_BAD_MANIFEST",
            InstallErrorCode::PasswordRequired => "-99",
            InstallErrorCode::Unknown(token) => token.as_str(),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            InstallErrorCode::AlreadyExists => "Package already installed",
            InstallErrorCode::DevicesNotFound => "Device not found",
            InstallErrorCode::DeviceOffline => "Device is offline",
            InstallErrorCode::InvalidApk => "APK file is invalid",
            InstallErrorCode::InvalidUri => "Invalid APK file name, avoid non-ASCII characters",
            InstallErrorCode::InsufficientStorage => "Not enough storage space on device",
            InstallErrorCode::DuplicatePackage => "A package with the same name already exists",
            InstallErrorCode::NoSharedUser => "Requested shared user does not exist",
            InstallErrorCode::UpdateIncompatible => {
                "Previously installed package left data behind, or signature differs"
            }
            InstallErrorCode::SharedUserIncompatible => {
                "Requested shared user exists with a different signature"
            }
            InstallErrorCode::MissingSharedLibrary => {
                "Package uses a shared library unavailable on the device"
            }
            InstallErrorCode::ReplaceCouldntDelete => "Could not delete the package being replaced",
            InstallErrorCode::Dexopt => "Dex optimisation failed or ran out of space",
            InstallErrorCode::DeviceNoSpace => "Not enough device storage to copy the APK",
            InstallErrorCode::DeviceCopyFailed => "Copying the APK to the device failed",
            InstallErrorCode::OlderSdk => "Device Android version too old for this APK",
            InstallErrorCode::ConflictingProvider => {
                "A content provider with the same authority already exists"
            }
            InstallErrorCode::NewerSdk => "APK requires an older Android version",
            InstallErrorCode::TestOnly => "Test-only APK installed without -t",
            InstallErrorCode::CpuAbiIncompatible => "Native code incompatible with the device ABI",
            InstallErrorCode::MissingFeature => "APK uses a feature the device lacks",
            InstallErrorCode::ContainerError => {
                "SD card access failed, or APK signed with the platform key"
            }
            InstallErrorCode::InvalidInstallLocation => {
                "Cannot install to the requested location"
            }
            InstallErrorCode::MediaUnavailable => "Install location unavailable",
            InstallErrorCode::VerificationTimeout => "Package verification timed out",
            InstallErrorCode::VerificationFailure => "Package verification failed, try rebooting",
            InstallErrorCode::AcwfIncompatible => "Application incompatible with the device",
            InstallErrorCode::DuplicatePermission => "APK defines a permission that already exists",
            InstallErrorCode::PackageChanged => "Package differs from what the caller expected",
            InstallErrorCode::PermissionModelDowngrade => {
                "Installed version uses runtime permissions, new version does not"
            }
            InstallErrorCode::InternalError => "Internal system error during install",
            InstallErrorCode::InvalidZipFile => "Invalid zip file, uninstall first",
            InstallErrorCode::UidChanged => "Leftover data directory with a different uid",
            InstallErrorCode::NoMatchingAbis => "APK not compatible with device CPU architecture",
            InstallErrorCode::VersionDowngrade => "A newer version is already installed",
            InstallErrorCode::UserRestricted => "User restricted from installing apps",
            InstallErrorCode::Aborted => "Installation was aborted",
            InstallErrorCode::CanceledByUser => "Installation needs user confirmation",
            InstallErrorCode::CancelledByUser => "Installation cancelled by user",
            InstallErrorCode::ParseNoCertificates => "APK is not signed",
            InstallErrorCode::ParseManifestEmpty => {
                "Manifest has no instrumentation or application tag"
            }
            InstallErrorCode::ParseManifestMalformed => "Manifest is structurally malformed",
            InstallErrorCode::ParseBadSharedUserId => "Manifest declares an invalid shared user id",
            InstallErrorCode::ParseBadPackageName => "Manifest package name missing or invalid",
            InstallErrorCode::ParseCertificateEncoding => "Certificate encoding error in APK",
            InstallErrorCode::ParseUnexpectedException => "Package parser hit an exception",
            InstallErrorCode::ParseInconsistentCertificates => {
                "APK signature inconsistent with installed version"
            }
            InstallErrorCode::ParseNotApk => "File is not an APK",
            InstallErrorCode::ParseBadManifest => "AndroidManifest.xml cannot be parsed",
            InstallErrorCode::PasswordRequired => "Installation requires a password",
            InstallErrorCode::Unknown(_) => "Unknown installation error",
        }
    }

    pub fn recovery(&self) -> Recovery {
        match self {
            InstallErrorCode::AlreadyExists => Recovery::TreatAsSuccess,
            InstallErrorCode::CanceledByUser
            | InstallErrorCode::CancelledByUser
            | InstallErrorCode::ParseNotApk => Recovery::SilentReinstall,
            InstallErrorCode::NoMatchingAbis | InstallErrorCode::OlderSdk => Recovery::Terminal,
            InstallErrorCode::ParseInconsistentCertificates
            | InstallErrorCode::VersionDowngrade
            | InstallErrorCode::ParseUnexpectedException => Recovery::ForceReinstall,
            _ => Recovery::Report,
        }
    }

    /// Exact lookup of a bare token such as `INSTALL_FAILED_OLDER_SDK` or `-99`.
    pub fn from_token(token: &str) -> Self {
        let token = token.trim();
        if PASSWORD_TOKENS.contains(&token) {
            return InstallErrorCode::PasswordRequired;
        }
        KNOWN_CODES
            .iter()
            .find(|code| code.token() == token)
            .cloned()
            .unwrap_or_else(|| InstallErrorCode::Unknown(token.to_string()))
    }

    /// Classifies raw install output. `Failure [TOKEN: detail]` is read first; otherwise any known
    /// token appearing anywhere in the text wins.
    pub fn from_output(output: &str) -> Option<Self> {
        if let Some(token) = failure_token(output) {
            let code = Self::from_token(&token);
            if !matches!(code, InstallErrorCode::Unknown(_)) {
                return Some(code);
            }
            if let Some(known) = Self::scan(output) {
                return Some(known);
            }
            return Some(code);
        }
        Self::scan(output)
    }

    fn scan(output: &str) -> Option<Self> {
        KNOWN_CODES
            .iter()
            .find(|code| output.contains(code.token()))
            .cloned()
    }
}

/// Extracts `TOKEN` out of `Failure [TOKEN: detail]` or `Failure [TOKEN]`.
pub fn failure_token(output: &str) -> Option<String> {
    let (_, tail) = output.split_once("Failure [")?;
    let token = match tail.split_once(':') {
        Some((head, _)) if !head.contains(']') => head,
        _ => tail.split(']').next().unwrap_or(tail),
    };
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
