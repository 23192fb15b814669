use huddle_media::{StreamKind, SubscribeError};
use serde::{Deserialize, Serialize};

/// Every failure the engine reports to callers.
///
/// Codes are stable and grouped by range: 0–11 general, 1000s auth,
/// 1500s join, 2000s session, 3000s/4000s devices, 5500s recording,
/// 6000s raw data and pipelines, 7000s sharing, 7500s file transfer,
/// 7600s spotlight.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HuddleError {
    // general
    #[error("wrong usage: {0}")]
    WrongUsage(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("engine not initialized")]
    NotInitialized,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("call made too frequently")]
    CallTooFrequently,
    #[error("feature not supported: {0}")]
    Unsupported(String),

    // auth
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("SDK key or secret is empty")]
    AuthEmptyKeyOrSecret,
    #[error("SDK key or secret is wrong")]
    AuthWrongKeyOrSecret,
    #[error("SDK access is disabled for this account")]
    AuthDisabled,

    // join
    #[error("session name is required")]
    NoSessionName,
    #[error("session token is required")]
    NoSessionToken,
    #[error("user name is required")]
    NoUserName,
    #[error("session name contains invalid characters")]
    InvalidSessionName,
    #[error("session password is invalid")]
    InvalidPassword,
    #[error("session token is invalid")]
    InvalidSessionToken,
    #[error("session name is too long")]
    SessionNameTooLong,
    #[error("session token was issued for another session")]
    TokenMismatchedSessionName,
    #[error("session token carries no session name")]
    TokenNoSessionName,
    #[error("session token role type is missing or wrong")]
    TokenRoleTypeInvalid,
    #[error("session token user identity is too long")]
    TokenUserIdentityTooLong,

    // session
    #[error("failed to join session: {0}")]
    JoinFailed(String),
    #[error("no rights to perform this action")]
    NoRights,
    #[error("operation already in progress")]
    AlreadyInProgress,
    #[error("sharing is locked by the host")]
    ShareLocked,
    #[error("session is reconnecting")]
    Reconnecting,
    #[error("session password required")]
    NeedPassword,
    #[error("session password is wrong")]
    PasswordWrong,
    #[error("not in a session")]
    NotInSession,
    #[error("transport failure: {0}")]
    Transport(String),

    // media
    #[error("device error on {device}")]
    DeviceError { device: String, detail: Option<i32> },
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("permission required for {0}")]
    PermissionRequired(String),
    #[error("audio module not ready")]
    AudioModuleNotReady,
    #[error("video module not ready")]
    VideoModuleNotReady,
    #[error("share module not ready")]
    ShareModuleNotReady,
    #[error("no {0} data available")]
    NoData(StreamKind),
    #[error("raw data sent too frequently")]
    SendTooFrequently,
    #[error("no recording in progress")]
    NoRecordingInProgress,

    // sharing
    #[error("not sharing")]
    NotSharing,
    #[error("share type is not supported")]
    ShareTypeUnsupported,
    #[error("camera share conflicts with the running video capture")]
    ShareCameraConflict,

    // file transfer
    #[error("file transfer failed: {0}")]
    FileTransfer(String),
    #[error("file type is blocked")]
    FileTypeBlocked,
    #[error("file exceeds the size limit")]
    FileSizeLimited,

    // spotlight
    #[error("not enough users to spotlight")]
    SpotlightNotEnoughUsers,
    #[error("too many spotlighted users")]
    SpotlightTooMany,
    #[error("user cannot be spotlighted")]
    SpotlightNotEligible,
    #[error("user has no video")]
    SpotlightUserWithoutVideo,
    #[error("user is not spotlighted")]
    SpotlightUserNotSpotlighted,

    #[error("subscribe failed: {0}")]
    Subscribe(#[from] SubscribeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    General,
    Auth,
    Join,
    Session,
    Media,
    Sharing,
    FileTransfer,
    Spotlight,
    Subscribe,
}

/// What the caller can do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Disposition {
    /// The same call may succeed later without any change.
    Retryable,
    /// The user must change input, grant a permission, or free a device.
    UserActionable,
    Terminal,
}

impl HuddleError {
    pub fn code(&self) -> u32 {
        use HuddleError::*;
        match self {
            WrongUsage(_) => 1,
            Internal(_) => 2,
            NotInitialized => 3,
            InvalidParameter(_) => 7,
            CallTooFrequently => 8,
            Unsupported(_) => 10,

            Auth(_) => 1001,
            AuthEmptyKeyOrSecret => 1002,
            AuthWrongKeyOrSecret => 1003,
            AuthDisabled => 1005,

            NoSessionName => 1500,
            NoSessionToken => 1501,
            NoUserName => 1502,
            InvalidSessionName => 1503,
            InvalidPassword => 1504,
            InvalidSessionToken => 1505,
            SessionNameTooLong => 1506,
            TokenMismatchedSessionName => 1507,
            TokenNoSessionName => 1508,
            TokenRoleTypeInvalid => 1509,
            TokenUserIdentityTooLong => 1510,

            Transport(_) => 2002,
            JoinFailed(_) => 2003,
            NoRights => 2004,
            AlreadyInProgress => 2005,
            ShareLocked => 2007,
            Reconnecting => 2008,
            NeedPassword => 2011,
            PasswordWrong => 2012,

            DeviceError { .. } => 4001,
            NoRecordingInProgress => 5503,
            NotInSession => 6002,
            VideoModuleNotReady => 6004,
            NoData(kind) if kind.is_share() => 6010,
            NoData(StreamKind::Audio) => 6013,
            NoData(_) => 6007,
            ShareModuleNotReady => 6008,
            AudioModuleNotReady => 6011,
            DeviceUnavailable(_) => 6015,
            PermissionRequired(_) => 6016,
            SendTooFrequently => 6021,
            Subscribe(e) => match e {
                SubscribeError::ExceededLimit => 6030,
                SubscribeError::ExclusiveTierTaken => 6031,
                SubscribeError::ShareLimit => 6032,
                SubscribeError::TooFrequent => 6033,
                SubscribeError::AlreadySubscribed => 6034,
                SubscribeError::NotSubscribed => 6035,
            },

            NotSharing => 7003,
            ShareTypeUnsupported => 7004,
            ShareCameraConflict => 7007,

            FileTransfer(_) => 7500,
            FileTypeBlocked => 7501,
            FileSizeLimited => 7502,

            SpotlightNotEnoughUsers => 7600,
            SpotlightTooMany => 7601,
            SpotlightNotEligible => 7602,
            SpotlightUserWithoutVideo => 7603,
            SpotlightUserNotSpotlighted => 7604,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self.code() {
            0..=999 => ErrorCategory::General,
            1000..=1499 => ErrorCategory::Auth,
            1500..=1999 => ErrorCategory::Join,
            6030..=6039 => ErrorCategory::Subscribe,
            2000..=2999 | 5500..=5999 | 6002 => ErrorCategory::Session,
            7000..=7499 => ErrorCategory::Sharing,
            7500..=7599 => ErrorCategory::FileTransfer,
            7600..=7699 => ErrorCategory::Spotlight,
            _ => ErrorCategory::Media,
        }
    }

    pub fn disposition(&self) -> Disposition {
        use HuddleError::*;
        match self {
            CallTooFrequently
            | SendTooFrequently
            | Reconnecting
            | AlreadyInProgress
            | AudioModuleNotReady
            | VideoModuleNotReady
            | ShareModuleNotReady
            | Transport(_)
            | Subscribe(SubscribeError::TooFrequent) => Disposition::Retryable,
            NoSessionName
            | NoSessionToken
            | NoUserName
            | InvalidSessionName
            | InvalidPassword
            | SessionNameTooLong
            | NeedPassword
            | PasswordWrong
            | InvalidParameter(_)
            | DeviceUnavailable(_)
            | PermissionRequired(_)
            | FileTypeBlocked
            | FileSizeLimited
            | ShareCameraConflict => Disposition::UserActionable,
            _ => Disposition::Terminal,
        }
    }

    /// Secondary code reported by a device or the transport, if any.
    pub fn detail_code(&self) -> Option<i32> {
        match self {
            HuddleError::DeviceError { detail, .. } => *detail,
            _ => None,
        }
    }
}
