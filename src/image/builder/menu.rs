// file: src/image/builder/menu.rs
// version: 1.0.0
// guid: ce19bae1-e6c0-4bf6-9214-2d93ed674e28

//! Stamped boot menu entries for GRUB and isolinux

use crate::error::AutoInstallError;
use crate::Result;

/// NoCloud datasource argument; `;` is a command separator in grub.cfg
pub const GRUB_SEED_ARG: &str = "ds=nocloud\\;s=/cdrom/nocloud/";

/// NoCloud datasource argument as written on plain kernel command lines
pub const SEED_ARG: &str = "ds=nocloud;s=/cdrom/nocloud/";

/// Kernel argument that skips the installer's confirmation prompt
pub const AUTOINSTALL_ARG: &str = "autoinstall";

// Markers are matched against trimmed lines, so the stamp is trimmed too
fn begin_marker(stamp: &str) -> String {
    format!("# BEGIN {}", stamp.trim())
}

fn end_marker(stamp: &str) -> String {
    format!("# END {}", stamp.trim())
}

/// Remove a block delimited by the stamp markers, if present
pub fn strip_stamped_block(config: &str, stamp: &str) -> Result<String> {
    let begin = begin_marker(stamp);
    let end = end_marker(stamp);
    let lines: Vec<&str> = config.split('\n').collect();

    let mut kept = Vec::with_capacity(lines.len());
    let mut inside = false;
    for line in lines {
        let trimmed = line.trim();
        if !inside && trimmed == begin {
            inside = true;
        } else if inside && trimmed == end {
            inside = false;
        } else if !inside {
            kept.push(line);
        }
    }
    if inside {
        return Err(AutoInstallError::layout(format!(
            "boot menu has '{}' without a matching '{}'",
            begin, end
        )));
    }
    Ok(kept.join("\n"))
}

/// Insert `block` before the first line for which `is_anchor` holds; anchors
/// include other stamped blocks so blocks never nest
fn insert_before(config: &str, block: &str, is_anchor: impl Fn(&str) -> bool) -> Option<String> {
    let lines: Vec<&str> = config.split('\n').collect();
    let index = lines.iter().position(|line| is_anchor(line.trim_start()))?;
    let mut out: Vec<&str> = Vec::with_capacity(lines.len() + 8);
    out.extend_from_slice(&lines[..index]);
    out.extend(block.lines());
    out.extend_from_slice(&lines[index..]);
    Some(out.join("\n"))
}

/// Kernel, initrd and command line of the first stock GRUB menu entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockEntry {
    pub kernel: String,
    pub initrd: String,
    /// Arguments before the `---` separator
    pub args: Vec<String>,
    /// Arguments after `---`, passed on to the installed system
    pub persistent_args: Vec<String>,
}

/// Split kernel arguments around the `---` separator
fn split_args<'a>(tokens: impl Iterator<Item = &'a str>) -> (Vec<String>, Vec<String>) {
    let mut before = Vec::new();
    let mut after = Vec::new();
    let mut separated = false;
    for token in tokens {
        if token == "---" {
            separated = true;
        } else if separated {
            after.push(token.to_string());
        } else {
            before.push(token.to_string());
        }
    }
    (before, after)
}

/// Arguments for the injected entry
fn command_line(stock: &[String], seed_arg: &str, no_prompt: bool, persistent: &[String]) -> String {
    let mut args: Vec<&str> = stock
        .iter()
        .map(String::as_str)
        .filter(|arg| *arg != AUTOINSTALL_ARG && !arg.starts_with("ds="))
        .collect();
    if no_prompt {
        args.push(AUTOINSTALL_ARG);
    }
    args.push(seed_arg);
    args.push("---");
    args.extend(persistent.iter().map(String::as_str));
    args.join(" ")
}

/// Find the first `menuentry` with both `linux` and `initrd` lines
pub fn first_grub_entry(config: &str) -> Option<StockEntry> {
    let mut in_entry = false;
    let mut linux: Option<(String, Vec<String>, Vec<String>)> = None;
    let mut initrd: Option<String> = None;

    for line in config.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("menuentry ") {
            in_entry = true;
            linux = None;
            initrd = None;
            continue;
        }
        if !in_entry {
            continue;
        }
        if trimmed == "}" {
            if let (Some((kernel, args, persistent_args)), Some(initrd)) = (linux.take(), initrd.take()) {
                return Some(StockEntry {
                    kernel,
                    initrd,
                    args,
                    persistent_args,
                });
            }
            in_entry = false;
            continue;
        }

        let mut tokens = trimmed.split_whitespace();
        match tokens.next() {
            Some("linux") | Some("linuxefi") => {
                if let Some(kernel) = tokens.next() {
                    let (args, persistent) = split_args(tokens);
                    linux = Some((kernel.to_string(), args, persistent));
                }
            }
            Some("initrd") | Some("initrdefi") => {
                initrd = tokens.next().map(str::to_string);
            }
            _ => {}
        }
    }
    None
}

/// Replace any previous stamped entry in `grub.cfg` with a fresh one placed
/// ahead of the stock entries
pub fn patch_grub_cfg(config: &str, stamp: &str, no_prompt: bool) -> Result<String> {
    let stock_config = strip_stamped_block(config, stamp)?;
    let stock = first_grub_entry(&stock_config).ok_or_else(|| {
        AutoInstallError::layout("grub.cfg has no menuentry with linux and initrd lines")
    })?;

    let block = format!(
        "{begin}\nmenuentry \"{stamp}\" {{\n\tset gfxpayload=keep\n\tlinux\t{kernel} {args}\n\tinitrd\t{initrd}\n}}\n{end}\n",
        begin = begin_marker(stamp),
        end = end_marker(stamp),
        stamp = stamp.trim(),
        kernel = stock.kernel,
        args = command_line(&stock.args, GRUB_SEED_ARG, no_prompt, &stock.persistent_args),
        initrd = stock.initrd,
    );

    insert_before(&stock_config, &block, |line| {
        line.starts_with("menuentry ") || line.starts_with("# BEGIN ")
    })
    .ok_or_else(|| AutoInstallError::layout("grub.cfg has no menuentry"))
}

/// First isolinux `label` with a `kernel` line; the initrd comes from its
/// `append initrd=...` argument
fn first_isolinux_label(config: &str) -> Option<StockEntry> {
    let mut kernel: Option<String> = None;
    let mut append: Option<Vec<String>> = None;
    let mut in_label = false;

    let finish = |kernel: &Option<String>, append: &Option<Vec<String>>| -> Option<StockEntry> {
        let kernel = kernel.clone()?;
        let tokens = append.clone()?;
        let initrd = tokens
            .iter()
            .find_map(|t| t.strip_prefix("initrd="))?
            .to_string();
        let (args, persistent_args) =
            split_args(tokens.iter().map(String::as_str).filter(|t| !t.starts_with("initrd=")));
        Some(StockEntry {
            kernel,
            initrd,
            args,
            persistent_args,
        })
    };

    for line in config.lines() {
        let mut tokens = line.split_whitespace();
        let keyword = tokens.next().map(str::to_ascii_lowercase);
        match keyword.as_deref() {
            Some("label") => {
                if in_label {
                    if let Some(entry) = finish(&kernel, &append) {
                        return Some(entry);
                    }
                }
                in_label = true;
                kernel = None;
                append = None;
            }
            Some("kernel") | Some("linux") if in_label => {
                kernel = tokens.next().map(str::to_string);
            }
            Some("append") if in_label => {
                append = Some(tokens.map(str::to_string).collect());
            }
            _ => {}
        }
    }
    if in_label {
        finish(&kernel, &append)
    } else {
        None
    }
}

/// Inject a stamped `label autoinstall` into an isolinux menu and make it the
/// default
pub fn patch_isolinux_cfg(config: &str, stamp: &str, no_prompt: bool) -> Result<String> {
    let stock_config = strip_stamped_block(config, stamp)?;
    let stock = first_isolinux_label(&stock_config).ok_or_else(|| {
        AutoInstallError::layout("isolinux menu has no label with kernel and initrd")
    })?;

    let block = format!(
        "{begin}\nlabel autoinstall\n  menu label ^{stamp}\n  kernel {kernel}\n  append initrd={initrd} {args}\n{end}\n",
        begin = begin_marker(stamp),
        end = end_marker(stamp),
        stamp = stamp.trim(),
        kernel = stock.kernel,
        initrd = stock.initrd,
        args = command_line(&stock.args, SEED_ARG, no_prompt, &stock.persistent_args),
    );

    let with_label = insert_before(&stock_config, &block, |line| {
        line.starts_with("# BEGIN ")
            || line
                .split_whitespace()
                .next()
                .is_some_and(|k| k.eq_ignore_ascii_case("label"))
    })
    .ok_or_else(|| AutoInstallError::layout("isolinux menu has no label"))?;

    let mut lines: Vec<String> = with_label.split('\n').map(str::to_string).collect();
    let default_line = lines.iter().position(|line| {
        line.split_whitespace()
            .next()
            .is_some_and(|k| k.eq_ignore_ascii_case("default"))
    });
    match default_line {
        Some(index) => lines[index] = "default autoinstall".to_string(),
        None => lines.insert(0, "default autoinstall".to_string()),
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso::fixture::{GRUB_CFG, TXT_CFG};

    const STAMP: &str = "paranoidNAS AutoInstall";

    #[test]
    fn test_first_grub_entry_from_stock_menu() {
        let entry = first_grub_entry(GRUB_CFG).unwrap();
        assert_eq!(entry.kernel, "/casper/vmlinuz");
        assert_eq!(entry.initrd, "/casper/initrd");
        assert!(entry.args.is_empty());
        assert!(entry.persistent_args.is_empty());
    }

    #[test]
    fn test_patch_grub_places_entry_first() {
        // Act
        let patched = patch_grub_cfg(GRUB_CFG, STAMP, true).unwrap();

        // Assert
        let begin = patched.find("# BEGIN paranoidNAS AutoInstall").unwrap();
        let stock = patched.find("menuentry \"Try or Install Ubuntu Server\"").unwrap();
        assert!(begin < stock);
        assert!(patched.contains(
            "\tlinux\t/casper/vmlinuz autoinstall ds=nocloud\\;s=/cdrom/nocloud/ ---\n"
        ));
        assert!(patched.contains("\tinitrd\t/casper/initrd\n}\n# END paranoidNAS AutoInstall\n"));
        assert!(patched.starts_with("set timeout=30\n"));
    }

    #[test]
    fn test_patch_grub_keeps_prompt_when_asked() {
        let patched = patch_grub_cfg(GRUB_CFG, STAMP, false).unwrap();
        assert!(patched.contains("\tlinux\t/casper/vmlinuz ds=nocloud\\;s=/cdrom/nocloud/ ---\n"));
        assert!(!patched.contains(" autoinstall "));
    }

    #[test]
    fn test_patch_grub_replaces_instead_of_duplicating() {
        let once = patch_grub_cfg(GRUB_CFG, STAMP, true).unwrap();
        let twice = patch_grub_cfg(&once, STAMP, true).unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.matches("# BEGIN paranoidNAS AutoInstall").count(), 1);

        let switched = patch_grub_cfg(&once, STAMP, false).unwrap();
        assert_eq!(switched.matches("menuentry \"paranoidNAS AutoInstall\"").count(), 1);
        assert_eq!(strip_stamped_block(&switched, STAMP).unwrap(), GRUB_CFG);
    }

    #[test]
    fn test_stamp_with_surrounding_whitespace_is_replaced() {
        // Arrange
        let padded = " Lab ";
        let once = patch_grub_cfg(GRUB_CFG, padded, false).unwrap();

        // Act
        let twice = patch_grub_cfg(&once, padded, false).unwrap();

        // Assert
        assert_eq!(twice.matches("# BEGIN Lab").count(), 1);
        assert_eq!(twice, once);
        assert!(twice.contains("menuentry \"Lab\" {"));
        assert_eq!(patch_grub_cfg(&once, "Lab", false).unwrap(), once);
    }

    #[test]
    fn test_other_stamps_are_left_alone() {
        let first = patch_grub_cfg(GRUB_CFG, "Lab A", true).unwrap();
        let both = patch_grub_cfg(&first, "Lab B", true).unwrap();
        assert_eq!(both.matches("# BEGIN Lab A").count(), 1);
        assert_eq!(both.matches("# BEGIN Lab B").count(), 1);
    }

    #[test]
    fn test_stock_arguments_are_carried() {
        let config = "menuentry \"Install\" {\n\tlinux /casper/vmlinuz quiet splash --- console=ttyS0\n\tinitrd /casper/initrd.gz\n}\n";
        let patched = patch_grub_cfg(config, STAMP, true).unwrap();
        assert!(patched.contains(
            "linux\t/casper/vmlinuz quiet splash autoinstall ds=nocloud\\;s=/cdrom/nocloud/ --- console=ttyS0"
        ));
        assert!(patched.contains("initrd\t/casper/initrd.gz"));
    }

    #[test]
    fn test_grub_without_entries_is_rejected() {
        let err = patch_grub_cfg("set timeout=5\n", STAMP, true).unwrap_err();
        assert!(matches!(err, AutoInstallError::UnsupportedImageLayout(_)));
    }

    #[test]
    fn test_unterminated_block_is_rejected() {
        let config = format!("# BEGIN {}\nmenuentry \"x\" {{\n", STAMP);
        assert!(strip_stamped_block(&config, STAMP).is_err());
    }

    #[test]
    fn test_patch_isolinux_sets_default() {
        // Act
        let patched = patch_isolinux_cfg(TXT_CFG, STAMP, true).unwrap();

        // Assert
        assert!(patched.starts_with("default autoinstall\n# BEGIN paranoidNAS AutoInstall\nlabel autoinstall\n"));
        assert!(patched.contains("  kernel /casper/vmlinuz\n"));
        assert!(patched.contains(
            "  append initrd=/casper/initrd quiet autoinstall ds=nocloud;s=/cdrom/nocloud/ ---\n"
        ));
        assert!(patched.contains("label live\n"));
    }

    #[test]
    fn test_patch_isolinux_is_idempotent() {
        let once = patch_isolinux_cfg(TXT_CFG, STAMP, true).unwrap();
        let twice = patch_isolinux_cfg(&once, STAMP, true).unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.matches("label autoinstall").count(), 1);
    }
}
