//! In-memory switch for tests
//!
//! Tracks channels, bridges and per-channel media flags, and records every
//! command in order so tests can assert on the exact sequence issued.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{Bridge, CallerId, Channel, ChannelState, OriginateRequest, SwitchClient, SwitchError};

#[derive(Default)]
struct Inner {
    channels: HashMap<String, Channel>,
    vars: HashMap<(String, String), String>,
    bridges: HashMap<String, Vec<String>>,
    globals: HashMap<String, String>,
    extensions: HashSet<(String, String)>,
    ringing: HashSet<String>,
    held: HashSet<String>,
    moh: HashSet<String>,
    muted: HashSet<String>,
    redirected: Vec<(String, Vec<String>)>,
    originated: Vec<OriginateRequest>,
    commands: Vec<String>,
}

pub struct FakeSwitch {
    app: String,
    inner: Mutex<Inner>,
    originate_seq: AtomicUsize,
    fail_originate: Mutex<bool>,
    fail_moh: Mutex<bool>,
    command_delay: Mutex<Option<Duration>>,
}

impl FakeSwitch {
    pub fn new(app: &str) -> Self {
        Self {
            app: app.to_string(),
            inner: Mutex::new(Inner::default()),
            originate_seq: AtomicUsize::new(0),
            fail_originate: Mutex::new(false),
            fail_moh: Mutex::new(false),
            command_delay: Mutex::new(None),
        }
    }

    /// Add a live, answered channel; `controlled` puts it under the application
    pub fn add_live_channel(&self, id: &str, controlled: bool) {
        let channel = Channel {
            id: id.to_string(),
            state: ChannelState::Up,
            caller: CallerId::default(),
            application: controlled.then(|| self.app.clone()),
        };
        self.inner
            .lock()
            .unwrap()
            .channels
            .insert(id.to_string(), channel);
    }

    /// Add a live channel carrying a user identity
    pub fn add_user_channel(&self, id: &str, controlled: bool, user_uuid: &str, tenant_uuid: &str) {
        self.add_live_channel(id, controlled);
        let mut inner = self.inner.lock().unwrap();
        inner.vars.insert(
            (id.to_string(), "WAZO_USERUUID".to_string()),
            user_uuid.to_string(),
        );
        inner.vars.insert(
            (id.to_string(), "WAZO_TENANT_UUID".to_string()),
            tenant_uuid.to_string(),
        );
    }

    pub fn add_bridge(&self, id: &str, channels: &[&str]) {
        self.inner.lock().unwrap().bridges.insert(
            id.to_string(),
            channels.iter().map(|c| c.to_string()).collect(),
        );
    }

    pub fn add_extension(&self, context: &str, exten: &str) {
        self.inner
            .lock()
            .unwrap()
            .extensions
            .insert((context.to_string(), exten.to_string()));
    }

    pub fn set_fail_originate(&self, fail: bool) {
        *self.fail_originate.lock().unwrap() = fail;
    }

    pub fn set_fail_moh(&self, fail: bool) {
        *self.fail_moh.lock().unwrap() = fail;
    }

    pub fn set_command_delay(&self, delay: Option<Duration>) {
        *self.command_delay.lock().unwrap() = delay;
    }

    /// Mark a channel answered (recipient picks up)
    pub fn answer(&self, id: &str) {
        if let Some(chan) = self.inner.lock().unwrap().channels.get_mut(id) {
            chan.state = ChannelState::Up;
        }
    }

    /// Drop a channel without any command, as if it hung up on its own
    pub fn vanish(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.channels.remove(id);
        for members in inner.bridges.values_mut() {
            members.retain(|c| c != id);
        }
    }

    pub fn channel_exists(&self, id: &str) -> bool {
        self.inner.lock().unwrap().channels.contains_key(id)
    }

    /// Sorted members of a bridge
    pub fn bridge_members(&self, id: &str) -> Option<Vec<String>> {
        self.inner.lock().unwrap().bridges.get(id).map(|m| {
            let mut members = m.clone();
            members.sort();
            members
        })
    }

    pub fn var(&self, channel: &str, name: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .vars
            .get(&(channel.to_string(), name.to_string()))
            .cloned()
    }

    pub fn is_ringing(&self, id: &str) -> bool {
        self.inner.lock().unwrap().ringing.contains(id)
    }

    pub fn is_held(&self, id: &str) -> bool {
        self.inner.lock().unwrap().held.contains(id)
    }

    pub fn has_moh(&self, id: &str) -> bool {
        self.inner.lock().unwrap().moh.contains(id)
    }

    pub fn is_muted(&self, id: &str) -> bool {
        self.inner.lock().unwrap().muted.contains(id)
    }

    pub fn redirected(&self) -> Vec<(String, Vec<String>)> {
        self.inner.lock().unwrap().redirected.clone()
    }

    pub fn originated(&self) -> Vec<OriginateRequest> {
        self.inner.lock().unwrap().originated.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.inner.lock().unwrap().commands.clone()
    }

    async fn record(&self, command: String) {
        let delay = *self.command_delay.lock().unwrap();
        self.inner.lock().unwrap().commands.push(command);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn require_channel(inner: &Inner, id: &str) -> Result<(), SwitchError> {
        if inner.channels.contains_key(id) {
            Ok(())
        } else {
            Err(SwitchError::NotFound(format!("channel {}", id)))
        }
    }

    async fn channel_flag(
        &self,
        op: &str,
        id: &str,
        set: impl FnOnce(&mut Inner),
    ) -> Result<(), SwitchError> {
        self.record(format!("{}:{}", op, id)).await;
        let mut inner = self.inner.lock().unwrap();
        Self::require_channel(&inner, id)?;
        set(&mut inner);
        Ok(())
    }
}

#[async_trait]
impl SwitchClient for FakeSwitch {
    fn application(&self) -> &str {
        &self.app
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Channel, SwitchError> {
        self.inner
            .lock()
            .unwrap()
            .channels
            .get(channel_id)
            .cloned()
            .ok_or_else(|| SwitchError::NotFound(format!("channel {}", channel_id)))
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, SwitchError> {
        Ok(self.inner.lock().unwrap().channels.values().cloned().collect())
    }

    async fn get_channel_var(&self, channel_id: &str, name: &str) -> Result<String, SwitchError> {
        let inner = self.inner.lock().unwrap();
        Self::require_channel(&inner, channel_id)?;
        Ok(inner
            .vars
            .get(&(channel_id.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_channel_var(
        &self,
        channel_id: &str,
        name: &str,
        value: &str,
    ) -> Result<(), SwitchError> {
        self.record(format!("set_var:{}:{}", channel_id, name)).await;
        let mut inner = self.inner.lock().unwrap();
        Self::require_channel(&inner, channel_id)?;
        inner.vars.insert(
            (channel_id.to_string(), name.to_string()),
            value.to_string(),
        );
        Ok(())
    }

    async fn originate(&self, request: OriginateRequest) -> Result<Channel, SwitchError> {
        self.record(format!("originate:{}", request.endpoint)).await;
        if *self.fail_originate.lock().unwrap() {
            return Err(SwitchError::Request("originate refused".to_string()));
        }
        let n = self.originate_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let channel = Channel {
            id: format!("recipient-{}", n),
            state: ChannelState::Ringing,
            caller: CallerId::default(),
            application: None,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.channels.insert(channel.id.clone(), channel.clone());
        inner.originated.push(request);
        Ok(channel)
    }

    async fn hangup(&self, channel_id: &str) -> Result<(), SwitchError> {
        self.record(format!("hangup:{}", channel_id)).await;
        let mut inner = self.inner.lock().unwrap();
        Self::require_channel(&inner, channel_id)?;
        inner.channels.remove(channel_id);
        for members in inner.bridges.values_mut() {
            members.retain(|c| c != channel_id);
        }
        Ok(())
    }

    async fn ring(&self, channel_id: &str) -> Result<(), SwitchError> {
        let id = channel_id.to_string();
        self.channel_flag("ring", channel_id, |i| {
            i.ringing.insert(id);
        })
        .await
    }

    async fn stop_ring(&self, channel_id: &str) -> Result<(), SwitchError> {
        self.channel_flag("stop_ring", channel_id, |i| {
            i.ringing.remove(channel_id);
        })
        .await
    }

    async fn hold(&self, channel_id: &str) -> Result<(), SwitchError> {
        let id = channel_id.to_string();
        self.channel_flag("hold", channel_id, |i| {
            i.held.insert(id);
        })
        .await
    }

    async fn unhold(&self, channel_id: &str) -> Result<(), SwitchError> {
        self.channel_flag("unhold", channel_id, |i| {
            i.held.remove(channel_id);
        })
        .await
    }

    async fn start_moh(&self, channel_id: &str, _moh_class: &str) -> Result<(), SwitchError> {
        if *self.fail_moh.lock().unwrap() {
            self.record(format!("moh:{}", channel_id)).await;
            return Err(SwitchError::Request("unknown moh class".to_string()));
        }
        let id = channel_id.to_string();
        self.channel_flag("moh", channel_id, |i| {
            i.moh.insert(id);
        })
        .await
    }

    async fn stop_moh(&self, channel_id: &str) -> Result<(), SwitchError> {
        self.channel_flag("stop_moh", channel_id, |i| {
            i.moh.remove(channel_id);
        })
        .await
    }

    async fn mute(&self, channel_id: &str) -> Result<(), SwitchError> {
        let id = channel_id.to_string();
        self.channel_flag("mute", channel_id, |i| {
            i.muted.insert(id);
        })
        .await
    }

    async fn unmute(&self, channel_id: &str) -> Result<(), SwitchError> {
        self.channel_flag("unmute", channel_id, |i| {
            i.muted.remove(channel_id);
        })
        .await
    }

    async fn redirect_to_app(
        &self,
        channel_id: &str,
        app_args: &[String],
    ) -> Result<(), SwitchError> {
        self.record(format!("redirect:{}", channel_id)).await;
        let mut inner = self.inner.lock().unwrap();
        Self::require_channel(&inner, channel_id)?;
        inner
            .redirected
            .push((channel_id.to_string(), app_args.to_vec()));
        Ok(())
    }

    async fn create_bridge(&self, bridge_id: &str) -> Result<Bridge, SwitchError> {
        self.record(format!("create_bridge:{}", bridge_id)).await;
        let mut inner = self.inner.lock().unwrap();
        let channels = inner
            .bridges
            .entry(bridge_id.to_string())
            .or_default()
            .clone();
        Ok(Bridge {
            id: bridge_id.to_string(),
            channels,
        })
    }

    async fn get_bridge(&self, bridge_id: &str) -> Result<Bridge, SwitchError> {
        self.inner
            .lock()
            .unwrap()
            .bridges
            .get(bridge_id)
            .map(|channels| Bridge {
                id: bridge_id.to_string(),
                channels: channels.clone(),
            })
            .ok_or_else(|| SwitchError::NotFound(format!("bridge {}", bridge_id)))
    }

    async fn list_bridges(&self) -> Result<Vec<Bridge>, SwitchError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .bridges
            .iter()
            .map(|(id, channels)| Bridge {
                id: id.clone(),
                channels: channels.clone(),
            })
            .collect())
    }

    async fn destroy_bridge(&self, bridge_id: &str) -> Result<(), SwitchError> {
        self.record(format!("destroy_bridge:{}", bridge_id)).await;
        self.inner
            .lock()
            .unwrap()
            .bridges
            .remove(bridge_id)
            .map(|_| ())
            .ok_or_else(|| SwitchError::NotFound(format!("bridge {}", bridge_id)))
    }

    async fn add_channel(&self, bridge_id: &str, channel_id: &str) -> Result<(), SwitchError> {
        self.record(format!("add_channel:{}:{}", bridge_id, channel_id))
            .await;
        let mut inner = self.inner.lock().unwrap();
        Self::require_channel(&inner, channel_id)?;
        // A channel sits in at most one bridge
        for members in inner.bridges.values_mut() {
            members.retain(|c| c != channel_id);
        }
        let members = inner
            .bridges
            .get_mut(bridge_id)
            .ok_or_else(|| SwitchError::NotFound(format!("bridge {}", bridge_id)))?;
        members.push(channel_id.to_string());
        Ok(())
    }

    async fn remove_channel(&self, bridge_id: &str, channel_id: &str) -> Result<(), SwitchError> {
        self.record(format!("remove_channel:{}:{}", bridge_id, channel_id))
            .await;
        let mut inner = self.inner.lock().unwrap();
        let members = inner
            .bridges
            .get_mut(bridge_id)
            .ok_or_else(|| SwitchError::NotFound(format!("bridge {}", bridge_id)))?;
        let before = members.len();
        members.retain(|c| c != channel_id);
        if members.len() == before {
            return Err(SwitchError::NotFound(format!("channel {}", channel_id)));
        }
        Ok(())
    }

    async fn extension_exists(&self, context: &str, exten: &str) -> Result<bool, SwitchError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .extensions
            .contains(&(context.to_string(), exten.to_string())))
    }

    async fn get_global_var(&self, name: &str) -> Result<Option<String>, SwitchError> {
        Ok(self.inner.lock().unwrap().globals.get(name).cloned())
    }

    async fn set_global_var(&self, name: &str, value: &str) -> Result<(), SwitchError> {
        let mut inner = self.inner.lock().unwrap();
        if value.is_empty() {
            inner.globals.remove(name);
        } else {
            inner.globals.insert(name.to_string(), value.to_string());
        }
        Ok(())
    }
}
