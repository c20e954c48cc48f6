//! # squashrun
//!
//! **Unprivileged HPC container launcher.**
//!
//! squashrun prepares an OCI runtime bundle from a squashfs image held in a
//! local, content-addressed repository and hands it off to an external
//! runc-compatible runtime. It targets multi-tenant HPC systems where
//! unprivileged users launch containers that expose selected host devices,
//! bind-mount host paths and integrate with site-provided hooks (MPI
//! acceleration, SSH injection, GPU enumeration).
//!
//! # Pipeline Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           squashrun                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  admin JSON ──► config::AdminConfig ─┐                           │
//! │  CLI request ─► config::CommandRun ──┼─► config::Config          │
//! │  image ref ───► image::ImageReference┘        │                  │
//! │                                               ▼                  │
//! │  ┌─────────────────────── runtime::Runtime ─────────────────┐    │
//! │  │ unshare ► bundle tmpfs ► squashfs+overlay rootfs ► /dev  │    │
//! │  │ ► etc files ► init ► custom/extra/device mounts ► nosuid │    │
//! │  │ ► fdhandler::FdHandler ► bundle::BundleConfig            │    │
//! │  └──────────────────────────┬────────────────────────────────┘   │
//! │                             ▼                                    │
//! │          fork ─► exec runc run --preserve-fds N <id>             │
//! │          (signal proxy + waitpid, status propagated)             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Confinement Model
//!
//! Every mount happens inside a mount namespace private to one invocation,
//! after `/` has been remounted `MS_SLAVE|MS_REC`. The bundle lives on a
//! tmpfs in that namespace; when the process exits the kernel releases the
//! namespace, the tmpfs, and the autoclear loop device backing the image.
//! There is deliberately no rollback code.
//!
//! # Scheduling Model
//!
//! Single-threaded and blocking by construction: one linear pipeline per
//! invocation, one forked child (the OCI runtime), blocking `waitpid`. The
//! only suspension points are kernel syscalls.

pub mod bundle;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod fdhandler;
pub mod image;
pub mod merger;
pub mod mount;
pub mod request;
pub mod runtime;

pub use error::{Context, Error, ErrorKind, Result};
