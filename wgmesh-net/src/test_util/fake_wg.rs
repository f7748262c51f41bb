//! In-process stand-in for the WireGuard tools.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::wg::{KeyPair, PeerStats, ToolError, ToolResult, WgTool};

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WgCall {
    Up(String, PathBuf),
    Down(String),
    IsUp(String),
    Show(String),
    GenKey,
    GenPsk,
}

/// How the next bring-up of an interface should misbehave.
#[derive(Debug, Clone)]
enum UpFault {
    /// Fails before anything is created.
    Fail(String),
    /// Creates the interface, then fails (e.g. peer configuration rejected).
    Partial(String),
    /// Never returns.
    Hang,
}

#[derive(Default)]
struct State {
    up: HashSet<String>,
    calls: Vec<WgCall>,
    up_faults: HashMap<String, UpFault>,
    down_faults: HashMap<String, String>,
    show_faults: HashMap<String, String>,
    peers: HashMap<String, Vec<PeerStats>>,
    keys_issued: u32,
}

/// Fake [`WgTool`]: tracks which interfaces are up, records every call and
/// can be told to fail, hang or half-succeed.
#[derive(Default)]
pub struct FakeWg {
    state: Mutex<State>,
}

impl FakeWg {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// All calls so far, in order.
    pub fn calls(&self) -> Vec<WgCall> {
        self.state().calls.clone()
    }

    /// Number of bring-up calls for `interface`.
    pub fn up_calls(&self, interface: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, WgCall::Up(name, _) if name == interface))
            .count()
    }

    /// Number of bring-down calls for `interface`.
    pub fn down_calls(&self, interface: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, WgCall::Down(name) if name == interface))
            .count()
    }

    pub fn is_interface_up(&self, interface: &str) -> bool {
        self.state().up.contains(interface)
    }

    /// Mark an interface as existing without going through `up`, as if it
    /// survived a restart of this process.
    pub fn set_up(&self, interface: &str) {
        self.state().up.insert(interface.to_string());
    }

    /// Make an interface disappear behind our back.
    pub fn remove_interface(&self, interface: &str) {
        self.state().up.remove(interface);
    }

    /// Next bring-up of `interface` exits non-zero with `diagnostic`.
    pub fn fail_next_up(&self, interface: &str, diagnostic: &str) {
        self.state().up_faults.insert(
            interface.to_string(),
            UpFault::Fail(diagnostic.to_string()),
        );
    }

    /// Next bring-up creates the interface but still exits non-zero.
    pub fn fail_next_up_partially(&self, interface: &str, diagnostic: &str) {
        self.state().up_faults.insert(
            interface.to_string(),
            UpFault::Partial(diagnostic.to_string()),
        );
    }

    /// Next bring-up never completes.
    pub fn hang_next_up(&self, interface: &str) {
        self.state()
            .up_faults
            .insert(interface.to_string(), UpFault::Hang);
    }

    pub fn fail_next_down(&self, interface: &str, diagnostic: &str) {
        self.state()
            .down_faults
            .insert(interface.to_string(), diagnostic.to_string());
    }

    /// Every `show` of `interface` fails until cleared.
    pub fn fail_show(&self, interface: &str, diagnostic: &str) {
        self.state()
            .show_faults
            .insert(interface.to_string(), diagnostic.to_string());
    }

    pub fn clear_show_fault(&self, interface: &str) {
        self.state().show_faults.remove(interface);
    }

    /// Counters returned by `show`.
    pub fn set_peers(&self, interface: &str, peers: Vec<PeerStats>) {
        self.state().peers.insert(interface.to_string(), peers);
    }

    fn failed(command: String, diagnostic: &str) -> ToolError {
        ToolError::Failed {
            command,
            status: "exit status: 1".to_string(),
            diagnostic: diagnostic.to_string(),
        }
    }
}

#[async_trait]
impl WgTool for FakeWg {
    async fn up(&self, interface: &str, config_path: &Path) -> ToolResult<()> {
        let fault = {
            let mut state = self.state();
            state
                .calls
                .push(WgCall::Up(interface.to_string(), config_path.to_path_buf()));

            let fault = state.up_faults.remove(interface);
            match &fault {
                None => {
                    if !state.up.insert(interface.to_string()) {
                        return Err(Self::failed(
                            format!("wg-quick up {}", config_path.display()),
                            &format!("wg-quick: `{}' already exists", interface),
                        ));
                    }
                    return Ok(());
                }
                Some(UpFault::Partial(_)) => {
                    state.up.insert(interface.to_string());
                }
                Some(_) => {}
            }
            fault
        };

        match fault {
            Some(UpFault::Fail(diagnostic)) | Some(UpFault::Partial(diagnostic)) => Err(
                Self::failed(format!("wg-quick up {}", config_path.display()), &diagnostic),
            ),
            Some(UpFault::Hang) => {
                std::future::pending::<()>().await;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn down(&self, interface: &str, _config_path: &Path) -> ToolResult<()> {
        let mut state = self.state();
        state.calls.push(WgCall::Down(interface.to_string()));

        if let Some(diagnostic) = state.down_faults.remove(interface) {
            return Err(Self::failed(format!("wg-quick down {}", interface), &diagnostic));
        }
        if !state.up.remove(interface) {
            return Err(Self::failed(
                format!("wg-quick down {}", interface),
                &format!("wg-quick: `{}' is not a WireGuard interface", interface),
            ));
        }
        Ok(())
    }

    async fn is_up(&self, interface: &str) -> ToolResult<bool> {
        let mut state = self.state();
        state.calls.push(WgCall::IsUp(interface.to_string()));
        Ok(state.up.contains(interface))
    }

    async fn show(&self, interface: &str) -> ToolResult<Vec<PeerStats>> {
        let mut state = self.state();
        state.calls.push(WgCall::Show(interface.to_string()));

        if let Some(diagnostic) = state.show_faults.get(interface) {
            return Err(Self::failed(format!("wg show {} dump", interface), diagnostic));
        }
        if !state.up.contains(interface) {
            return Err(Self::failed(
                format!("wg show {} dump", interface),
                "Unable to access interface: No such device",
            ));
        }
        Ok(state.peers.get(interface).cloned().unwrap_or_default())
    }

    async fn generate_keypair(&self) -> ToolResult<KeyPair> {
        let mut state = self.state();
        state.calls.push(WgCall::GenKey);
        state.keys_issued += 1;
        let n = state.keys_issued;
        Ok(KeyPair {
            private_key: format!("fake-private-{:04}", n),
            public_key: format!("fake-public-{:04}", n),
        })
    }

    async fn generate_preshared_key(&self) -> ToolResult<String> {
        let mut state = self.state();
        state.calls.push(WgCall::GenPsk);
        state.keys_issued += 1;
        Ok(format!("fake-psk-{:04}", state.keys_issued))
    }
}
