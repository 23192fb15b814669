//! Remote camera control: asking another participant for their camera,
//! steering it once approved, and answering such requests for our own.
//!
//! The server keeps the authoritative grant per camera owner. The client
//! mirrors what concerns the local user so calls fail early.

use std::ops::RangeInclusive;
use std::sync::Arc;

use huddle_media::StreamKind;

use crate::errors::HuddleError;
use crate::events::CameraMove;
use crate::session::{SessionContext, Shared};
use crate::transport::{CameraControlRequest, ClientSignal};

/// Accepted step size for pan, tilt and zoom.
pub const MOVE_RANGE: RangeInclusive<u32> = 10..=100;

#[derive(Debug, Default)]
pub(crate) struct CameraControlState {
    /// Users waiting for an answer about the local camera.
    pub requests: Vec<u64>,
    pub controller: Option<u64>,
    /// Remote cameras we asked for and have no answer about yet.
    pub requested: Vec<u64>,
    /// Remote cameras we may steer.
    pub controlling: Vec<u64>,
}

impl CameraControlState {
    pub fn on_requested(&mut self, by: u64) {
        if !self.requests.contains(&by) {
            self.requests.push(by);
        }
    }

    pub fn on_result(&mut self, user_id: u64, approved: bool) {
        self.requested.retain(|u| *u != user_id);
        if approved && !self.controlling.contains(&user_id) {
            self.controlling.push(user_id);
        }
    }

    pub fn on_released(&mut self, me: Option<u64>, user_id: u64, controller_id: u64) {
        if me == Some(user_id) {
            if self.controller == Some(controller_id) {
                self.controller = None;
            }
            self.requests.retain(|u| *u != controller_id);
        } else {
            self.requested.retain(|u| *u != user_id);
            self.controlling.retain(|u| *u != user_id);
        }
    }

    pub fn forget_user(&mut self, user_id: u64) {
        self.requests.retain(|u| *u != user_id);
        self.requested.retain(|u| *u != user_id);
        self.controlling.retain(|u| *u != user_id);
        if self.controller == Some(user_id) {
            self.controller = None;
        }
    }
}

/// Steers one remote user's camera, obtained from
/// [`SessionEngine::remote_camera_control`](crate::SessionEngine::remote_camera_control).
#[derive(Clone)]
pub struct RemoteCameraControlHelper {
    shared: Arc<Shared>,
    user_id: u64,
}

impl RemoteCameraControlHelper {
    pub(crate) fn new(shared: Arc<Shared>, user_id: u64) -> Self {
        Self { shared, user_id }
    }

    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    fn send(&self, request: CameraControlRequest) -> Result<(), HuddleError> {
        self.shared.send(ClientSignal::CameraControl(request))
    }

    fn require_remote(&self, ctx: &SessionContext) -> Result<(), HuddleError> {
        if ctx.my_id() == Some(self.user_id) || !ctx.roster.contains(self.user_id) {
            return Err(HuddleError::InvalidParameter(format!(
                "cannot control the camera of user {}",
                self.user_id
            )));
        }
        Ok(())
    }

    /// Ask the owner for control. The answer arrives as
    /// `MediaEvent::CameraControlResult`.
    pub fn request_control(&self) -> Result<(), HuddleError> {
        {
            let mut ctx = self.shared.require_in_session()?;
            self.require_remote(&ctx)?;
            if !ctx.roster.user(self.user_id).is_some_and(|u| u.video_on) {
                return Err(HuddleError::NoData(StreamKind::Video));
            }
            if ctx.camera.controlling.contains(&self.user_id) {
                return Ok(());
            }
            if ctx.camera.requested.contains(&self.user_id) {
                return Err(HuddleError::AlreadyInProgress);
            }
            ctx.camera.requested.push(self.user_id);
        }
        tracing::info!(user_id = self.user_id, "requesting camera control");
        let sent = self.send(CameraControlRequest::Request {
            user_id: self.user_id,
        });
        if sent.is_err() {
            self.shared.ctx().camera.requested.retain(|u| *u != self.user_id);
        }
        sent
    }

    pub fn give_up_control(&self) -> Result<(), HuddleError> {
        {
            let mut ctx = self.shared.require_in_session()?;
            let camera = &mut ctx.camera;
            let id = self.user_id;
            if !camera.controlling.contains(&id) && !camera.requested.contains(&id) {
                return Err(HuddleError::WrongUsage("camera is not controlled".into()));
            }
            camera.controlling.retain(|u| *u != self.user_id);
            camera.requested.retain(|u| *u != self.user_id);
        }
        self.send(CameraControlRequest::GiveUp {
            user_id: self.user_id,
        })
    }

    pub fn is_controlling(&self) -> bool {
        self.shared.ctx().camera.controlling.contains(&self.user_id)
    }

    fn steer(&self, action: CameraMove, range: u32) -> Result<(), HuddleError> {
        if !MOVE_RANGE.contains(&range) {
            return Err(HuddleError::InvalidParameter(format!(
                "camera range must be {}..={}, got {range}",
                MOVE_RANGE.start(),
                MOVE_RANGE.end()
            )));
        }
        {
            let ctx = self.shared.require_in_session()?;
            if !ctx.camera.controlling.contains(&self.user_id) {
                return Err(HuddleError::NoRights);
            }
        }
        tracing::debug!(user_id = self.user_id, ?action, range, "camera move");
        self.send(CameraControlRequest::Move {
            user_id: self.user_id,
            action,
            range,
        })
    }

    pub fn turn_left(&self, range: u32) -> Result<(), HuddleError> {
        self.steer(CameraMove::Left, range)
    }

    pub fn turn_right(&self, range: u32) -> Result<(), HuddleError> {
        self.steer(CameraMove::Right, range)
    }

    pub fn turn_up(&self, range: u32) -> Result<(), HuddleError> {
        self.steer(CameraMove::Up, range)
    }

    pub fn turn_down(&self, range: u32) -> Result<(), HuddleError> {
        self.steer(CameraMove::Down, range)
    }

    pub fn zoom_in(&self, range: u32) -> Result<(), HuddleError> {
        self.steer(CameraMove::ZoomIn, range)
    }

    pub fn zoom_out(&self, range: u32) -> Result<(), HuddleError> {
        self.steer(CameraMove::ZoomOut, range)
    }
}

/// Answers requests to steer the local camera, obtained from
/// [`SessionEngine::camera_control_requests`](crate::SessionEngine::camera_control_requests).
#[derive(Clone)]
pub struct CameraControlResponder {
    shared: Arc<Shared>,
}

impl CameraControlResponder {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn pending_requests(&self) -> Vec<u64> {
        self.shared.ctx().camera.requests.clone()
    }

    pub fn controller(&self) -> Option<u64> {
        self.shared.ctx().camera.controller
    }

    fn respond(&self, requester_id: u64, approve: bool) -> Result<(), HuddleError> {
        {
            let mut ctx = self.shared.require_in_session()?;
            if !ctx.camera.requests.contains(&requester_id) {
                return Err(HuddleError::InvalidParameter(format!(
                    "no camera control request from {requester_id}"
                )));
            }
            ctx.camera.requests.retain(|u| *u != requester_id);
            if approve {
                ctx.camera.controller = Some(requester_id);
            }
        }
        tracing::info!(requester_id, approve, "camera control request answered");
        self.shared.send(ClientSignal::CameraControl(CameraControlRequest::Respond {
            requester_id,
            approve,
        }))
    }

    pub fn approve(&self, requester_id: u64) -> Result<(), HuddleError> {
        self.respond(requester_id, true)
    }

    pub fn decline(&self, requester_id: u64) -> Result<(), HuddleError> {
        self.respond(requester_id, false)
    }

    /// Take control back from the current controller.
    pub fn revoke(&self) -> Result<(), HuddleError> {
        {
            let mut ctx = self.shared.require_in_session()?;
            if ctx.camera.controller.take().is_none() {
                return Err(HuddleError::WrongUsage("camera is not controlled".into()));
            }
        }
        self.shared
            .send(ClientSignal::CameraControl(CameraControlRequest::Revoke))
    }
}
