//! 请求分发
//!
//! 把一帧请求文本解码为 [`Request`]，按类型调用 [`SharedCamera`]，再把结果或错误包装成 [`Response`]。

use crate::error::RequestError;
use crate::stats::ServerStats;
use camshare_driver::{ReleaseOutcome, SharedCamera};
use camshare_protocol::{
    ConnectParams, DeviceInfoParams, FilterWheelCommand, ProtocolError, ReadoutRegion, Request,
    RequestKind, Response, StartExposureParams, SubDeviceParams, TemperatureRegulation,
};
use serde::Serialize;
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// 分发结果
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// 写回响应
    Reply(Response),
    /// 不写任何东西（保活帧）
    Silent,
    /// 写回响应后关闭连接
    Close(Response),
}

/// 单个连接的会话状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub id: u64,
    /// 本连接通过 `connect` 获得、尚未 `disconnect` 的引用数
    pub held_refs: usize,
}

impl ConnectionState {
    pub fn new(id: u64) -> Self {
        Self { id, held_refs: 0 }
    }
}

/// 请求分发器（所有连接共享）
pub struct Dispatcher {
    camera: Arc<SharedCamera>,
    stats: Arc<ServerStats>,
}

impl Dispatcher {
    pub fn new(camera: Arc<SharedCamera>, stats: Arc<ServerStats>) -> Self {
        Self { camera, stats }
    }

    pub fn camera(&self) -> &Arc<SharedCamera> {
        &self.camera
    }

    /// 处理一帧请求文本
    pub fn handle_frame(&self, frame: &str, conn: &mut ConnectionState) -> DispatchOutcome {
        let request: Request = match serde_json::from_str(frame) {
            Ok(request) => request,
            Err(e) => return self.reject(conn, ProtocolError::from(e).into()),
        };
        let kind = match request.request_kind() {
            Ok(kind) => kind,
            Err(e) => return self.reject(conn, e.into()),
        };

        match kind {
            RequestKind::KeepAlive => DispatchOutcome::Silent,
            RequestKind::Bye => {
                self.stats.request_handled();
                DispatchOutcome::Close(Response::ok(Value::String("bye".to_string())))
            },
            _ => {
                let result = catch_unwind(AssertUnwindSafe(|| self.execute(kind, &request, conn)))
                    .unwrap_or_else(|_| {
                        error!("[conn {}] Handler panicked on `{}`", conn.id, kind);
                        Err(RequestError::Panicked(kind.to_string()))
                    });
                match result {
                    Ok(payload) => {
                        self.stats.request_handled();
                        DispatchOutcome::Reply(Response::ok(payload))
                    },
                    Err(e) => self.reject(conn, e),
                }
            },
        }
    }

    /// 把解码或执行错误转成错误响应
    pub fn reject(&self, conn: &ConnectionState, err: RequestError) -> DispatchOutcome {
        self.stats.request_handled();
        self.stats.request_failed();
        warn!("[conn {}] Request failed: {}", conn.id, err);
        DispatchOutcome::Reply(Response::error(err.to_string()))
    }

    fn execute(
        &self,
        kind: RequestKind,
        request: &Request,
        conn: &mut ConnectionState,
    ) -> Result<Value, RequestError> {
        debug!("[conn {}] {}", conn.id, kind);
        let camera = &self.camera;

        match kind {
            RequestKind::Connect => {
                let params: ConnectParams = request.params()?;
                let connected = camera.connect(&params)?;
                if connected {
                    conn.held_refs += 1;
                }
                Ok(Value::Bool(connected))
            },
            RequestKind::Disconnect => {
                let outcome = camera.disconnect();
                if outcome.released() {
                    conn.held_refs = conn.held_refs.saturating_sub(1);
                }
                if let ReleaseOutcome::Closed(teardown) = &outcome
                    && !teardown.is_clean()
                {
                    debug!("[conn {}] Teardown reported {:?}", conn.id, teardown);
                }
                Ok(Value::Null)
            },
            RequestKind::StartExposure => {
                let params: StartExposureParams = request.params()?;
                camera.start_exposure(&params)?;
                Ok(Value::Null)
            },
            RequestKind::AbortExposure => {
                let params: SubDeviceParams = request.params()?;
                camera.abort_exposure(params.sub_device)?;
                Ok(Value::Null)
            },
            RequestKind::ExposureInProgress => {
                let params: SubDeviceParams = request.params()?;
                Ok(Value::Bool(camera.exposure_in_progress(params.sub_device)))
            },
            RequestKind::EndReadout => {
                let params: SubDeviceParams = request.params()?;
                camera.end_readout(params.sub_device)?;
                Ok(Value::Null)
            },
            RequestKind::ReadPixels => {
                let region: ReadoutRegion = request.params()?;
                let pixels = camera.read_pixels(&region)?;
                to_payload(&pixels.compress())
            },
            RequestKind::QueryTemperature => to_payload(&camera.query_temperature()?),
            RequestKind::SetTemperature => {
                let regulation: TemperatureRegulation = request.params()?;
                camera.set_temperature(&regulation)?;
                Ok(Value::Null)
            },
            RequestKind::GetDeviceInfo => {
                let params: DeviceInfoParams = request.params()?;
                to_payload(&camera.device_info(params.request)?)
            },
            RequestKind::FilterWheel => {
                let command: FilterWheelCommand = request.params()?;
                to_payload(&camera.filter_wheel(command)?)
            },
            RequestKind::Command => {
                let code = request.command_code()?;
                Ok(camera.execute(code, &request.parameters)?)
            },
            RequestKind::Status => to_payload(&self.stats.snapshot(camera)),
            // 在 handle_frame 中处理
            RequestKind::KeepAlive | RequestKind::Bye => Ok(Value::Null),
        }
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<Value, RequestError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::from(e).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camshare_driver::{SimProbe, SimulatedCamera, SimulatorConfig};
    use camshare_protocol::{CommandCode, CompressedPixels, ServiceStatus, SubDevice};
    use serde_json::json;

    fn dispatcher() -> (Dispatcher, Arc<SimProbe>) {
        let sim = SimulatedCamera::new(SimulatorConfig::default());
        let probe = sim.probe();
        let camera = Arc::new(SharedCamera::new(sim));
        (
            Dispatcher::new(camera, Arc::new(ServerStats::new())),
            probe,
        )
    }

    fn reply(outcome: DispatchOutcome) -> Response {
        match outcome {
            DispatchOutcome::Reply(response) => response,
            other => panic!("expected a reply, got {:?}", other),
        }
    }

    fn call(d: &Dispatcher, conn: &mut ConnectionState, frame: Value) -> Response {
        reply(d.handle_frame(&frame.to_string(), conn))
    }

    #[test]
    fn test_connect_tracks_held_refs() {
        let (d, _probe) = dispatcher();
        let mut conn = ConnectionState::new(1);

        let resp = call(&d, &mut conn, json!({"type": "connect"}));
        assert_eq!(resp.payload, json!(true));
        assert_eq!(conn.held_refs, 1);

        let resp = call(&d, &mut conn, json!({"type": "disconnect"}));
        assert!(!resp.is_error());
        assert_eq!(conn.held_refs, 0);
        assert_eq!(d.camera().ref_count(), 0);
    }

    #[test]
    fn test_connect_without_camera_is_false_not_error() {
        let (d, probe) = dispatcher();
        probe.set_present(false);
        let mut conn = ConnectionState::new(1);

        let resp = call(&d, &mut conn, json!({"type": "connect", "parameters": {"address": ""}}));
        assert!(!resp.is_error());
        assert_eq!(resp.payload, json!(false));
        assert_eq!(conn.held_refs, 0);
    }

    #[test]
    fn test_disconnect_without_connect_is_harmless() {
        let (d, probe) = dispatcher();
        let mut conn = ConnectionState::new(1);
        let resp = call(&d, &mut conn, json!({"type": "disconnect"}));
        assert!(!resp.is_error());
        assert_eq!(d.camera().ref_count(), 0);
        assert_eq!(probe.close_count(), 0);
    }

    #[test]
    fn test_hardware_request_while_disconnected() {
        let (d, _probe) = dispatcher();
        let mut conn = ConnectionState::new(1);
        let resp = call(
            &d,
            &mut conn,
            json!({"type": "start-exposure", "parameters": {"sub_device": "imaging", "duration_secs": 1.0}}),
        );
        assert_eq!(resp.error.as_deref(), Some("Device not connected"));
    }

    #[test]
    fn test_malformed_and_unknown_requests() {
        let (d, _probe) = dispatcher();
        let mut conn = ConnectionState::new(1);

        let resp = reply(d.handle_frame("{not json", &mut conn));
        assert!(resp.error.unwrap().starts_with("Malformed JSON"));

        let resp = call(&d, &mut conn, json!({"type": "teleport"}));
        assert_eq!(resp.error.as_deref(), Some("Unknown request type: teleport"));

        let resp = call(&d, &mut conn, json!({"type": "end-readout", "parameters": {}}));
        assert!(resp.is_error());
    }

    #[test]
    fn test_keepalive_is_silent_and_bye_closes() {
        let (d, _probe) = dispatcher();
        let mut conn = ConnectionState::new(1);
        assert_eq!(
            d.handle_frame(r#"{"type":"keepalive"}"#, &mut conn),
            DispatchOutcome::Silent
        );
        assert_eq!(
            d.handle_frame(r#"{"type":"bye"}"#, &mut conn),
            DispatchOutcome::Close(Response::ok(json!("bye")))
        );
    }

    #[test]
    fn test_read_pixels_payload_decodes() {
        let (d, _probe) = dispatcher();
        let mut conn = ConnectionState::new(1);
        call(&d, &mut conn, json!({"type": "connect"}));

        let resp = call(
            &d,
            &mut conn,
            json!({"type": "read-pixels", "parameters": {"sub_device": "imaging", "width": 40, "height": 30}}),
        );
        let compressed: CompressedPixels = resp.payload_as().unwrap();
        let pixels = compressed.decompress().unwrap();
        assert_eq!((pixels.width(), pixels.height()), (40, 30));
    }

    #[test]
    fn test_passthrough_command() {
        let (d, probe) = dispatcher();
        let mut conn = ConnectionState::new(1);
        call(&d, &mut conn, json!({"type": "connect"}));

        let resp = call(&d, &mut conn, json!({"type": "command", "command": 12}));
        assert_eq!(resp.payload["imaging_exposing"], json!(false));
        assert_eq!(
            probe.command_log(),
            vec![CommandCode::QUERY_COMMAND_STATUS]
        );

        let resp = call(&d, &mut conn, json!({"type": "command"}));
        assert!(resp.error.unwrap().contains("numeric `command` code"));
    }

    #[test]
    fn test_exposure_requests() {
        let (d, _probe) = dispatcher();
        let mut conn = ConnectionState::new(1);
        call(&d, &mut conn, json!({"type": "connect"}));

        let resp = call(
            &d,
            &mut conn,
            json!({"type": "start-exposure", "parameters": {"sub_device": "tracking", "duration_secs": 60.0}}),
        );
        assert!(!resp.is_error());

        let resp = call(
            &d,
            &mut conn,
            json!({"type": "exposure-in-progress", "parameters": {"sub_device": "tracking"}}),
        );
        assert_eq!(resp.payload, json!(true));

        call(
            &d,
            &mut conn,
            json!({"type": "abort-exposure", "parameters": {"sub_device": "tracking"}}),
        );
        assert!(!d.camera().exposure_in_progress(SubDevice::Tracking));
    }

    #[test]
    fn test_status_reports_refcount() {
        let (d, _probe) = dispatcher();
        let mut a = ConnectionState::new(1);
        let mut b = ConnectionState::new(2);
        call(&d, &mut a, json!({"type": "connect"}));
        call(&d, &mut b, json!({"type": "connect"}));

        let resp = call(&d, &mut a, json!({"type": "status"}));
        let status: ServiceStatus = resp.payload_as().unwrap();
        assert_eq!(status.ref_count, 2);
        assert!(status.hardware_open);
    }

    #[test]
    fn test_device_info_variants() {
        let (d, _probe) = dispatcher();
        let mut conn = ConnectionState::new(1);
        call(&d, &mut conn, json!({"type": "connect"}));

        let resp = call(&d, &mut conn, json!({"type": "get-device-info"}));
        assert_eq!(resp.payload["serial"], json!("SIM-0001"));

        let resp = call(
            &d,
            &mut conn,
            json!({"type": "get-device-info", "parameters": {"request": "driver"}}),
        );
        assert_eq!(resp.payload["name"], json!("simulator"));
    }
}
