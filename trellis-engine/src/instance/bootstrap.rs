//! First-boot bootstrap payload
//!
//! A shell script handed to the instance as user data. It shuts the image's
//! factory remote-access channels, installs a hardened SSH configuration,
//! sets a one-time credential on the image account and renames that account
//! to the cluster's standard account name. The script holds a secret, so it
//! is wiped from the instance once the node has booted with it.

use std::fmt;

use uuid::Uuid;

/// The rendered first-boot script
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapPayload {
    script: String,
}

impl BootstrapPayload {
    /// Renders a payload with a freshly generated one-time credential
    ///
    /// # Arguments
    /// * `image_account` - Account the machine image ships with
    /// * `admin_account` - Name the image account is renamed to
    pub fn generate(image_account: &str, admin_account: &str) -> Self {
        let credential = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        Self::with_credential(image_account, admin_account, &credential)
    }

    /// Renders a payload with a caller-supplied credential
    pub fn with_credential(image_account: &str, admin_account: &str, credential: &str) -> Self {
        let script = format!(
            r#"#!/bin/sh
set -eu

# factory remote access
for unit in telnet.socket rsh.socket rlogin.socket; do
    systemctl disable --now "$unit" 2>/dev/null || true
done

# ssh
install -d -m 0755 /etc/ssh/sshd_config.d
cat > /etc/ssh/sshd_config.d/00-trellis.conf <<'SSHD'
PermitRootLogin no
PasswordAuthentication no
KbdInteractiveAuthentication no
PermitEmptyPasswords no
X11Forwarding no
SSHD
chmod 0600 /etc/ssh/sshd_config.d/00-trellis.conf
systemctl restart sshd 2>/dev/null || systemctl restart ssh

# one-time credential
echo '{image_account}:{credential}' | chpasswd
passwd --expire '{image_account}'

# standard account name
if id '{image_account}' >/dev/null 2>&1 && ! id '{admin_account}' >/dev/null 2>&1; then
    usermod --login '{admin_account}' --move-home --home '/home/{admin_account}' '{image_account}'
    groupmod --new-name '{admin_account}' '{image_account}' 2>/dev/null || true
fi
"#
        );
        Self { script }
    }

    pub fn as_str(&self) -> &str {
        &self.script
    }

    pub fn into_script(self) -> String {
        self.script
    }
}

impl fmt::Debug for BootstrapPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapPayload")
            .field("script", &"<redacted>")
            .finish()
    }
}
