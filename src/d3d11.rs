// D3D11 device creation and GPU→CPU texture readback.
//
// The reader copies row by row from the mapped stride, taking exactly
// `width * 4` bytes per row: the trailing RowPitch bytes are driver
// alignment (typically to 64 or 256) and reading them would shear the
// image diagonally on resized windows.

use anyhow::{bail, Context, Result};
use tracing::debug;
use windows::core::Interface;
use windows::Graphics::DirectX::Direct3D11::IDirect3DDevice;
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::{D3D_DRIVER_TYPE_HARDWARE, D3D_FEATURE_LEVEL_11_0};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D, D3D11_CPU_ACCESS_READ,
    D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_READ, D3D11_SDK_VERSION,
    D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::IDXGIDevice;
use windows::Win32::System::WinRT::Direct3D11::CreateDirect3D11DeviceFromDXGIDevice;

const BYTES_PER_PIXEL: usize = 4; // BGRA8

/// D3D11 device bundle. Thread-affine: the device context must stay on
/// the thread that created it.
pub struct D3D11Context {
    pub device: ID3D11Device,
    pub context: ID3D11DeviceContext,
    pub dxgi_device: IDXGIDevice,
    pub direct3d_device: IDirect3DDevice,
}

/// Create a hardware D3D11 device with BGRA support.
pub fn create_d3d11_device() -> Result<D3D11Context> {
    let (device, context) = unsafe {
        let mut device = None;
        let mut context = None;

        // SAFETY: out-pointers are valid locals; the call fills both on success.
        D3D11CreateDevice(
            None,
            D3D_DRIVER_TYPE_HARDWARE,
            HMODULE::default(),
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            Some(&[D3D_FEATURE_LEVEL_11_0]),
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )
        .context("D3D11CreateDevice failed")?;

        (device.unwrap(), context.unwrap())
    };

    let dxgi_device: IDXGIDevice = device.cast().context("device is not a DXGI device")?;

    let direct3d_device: IDirect3DDevice = unsafe {
        // SAFETY: dxgi_device is a live COM object from the cast above.
        CreateDirect3D11DeviceFromDXGIDevice(&dxgi_device)
            .context("CreateDirect3D11DeviceFromDXGIDevice failed")?
            .cast()
            .context("WinRT device cast failed")?
    };

    if let Ok(adapter) = unsafe { dxgi_device.GetAdapter() } {
        if let Ok(desc) = unsafe { adapter.GetDesc() } {
            let name = String::from_utf16_lossy(&desc.Description);
            debug!(gpu = name.trim_end_matches('\0'), "d3d11 device created");
        }
    }

    Ok(D3D11Context {
        device,
        context,
        dxgi_device,
        direct3d_device,
    })
}

/// GPU→CPU texture reader for BGRA8 capture surfaces.
///
/// The staging texture is created on demand, cached, and rebuilt when
/// the source size changes. Output rows are tightly packed
/// (`width * 4` bytes each) with RowPitch padding stripped.
pub struct TextureReader {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    staging: Option<ID3D11Texture2D>,
    width: u32,
    height: u32,
}

impl TextureReader {
    pub fn new(device: ID3D11Device, context: ID3D11DeviceContext) -> Self {
        Self {
            device,
            context,
            staging: None,
            width: 0,
            height: 0,
        }
    }

    fn ensure_staging(&mut self, width: u32, height: u32) -> Result<()> {
        if self.staging.is_some() && self.width == width && self.height == height {
            return Ok(());
        }

        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
        };

        // SAFETY: desc is fully initialized; CreateTexture2D writes the
        // local out-pointer only.
        unsafe {
            let mut texture = None;
            self.device
                .CreateTexture2D(&desc, None, Some(&mut texture))
                .context("failed to create staging texture")?;
            self.staging = Some(texture.unwrap());
        }
        self.width = width;
        self.height = height;
        Ok(())
    }

    /// Copy `copy_w × copy_h` pixels from the texture's top-left into
    /// `out`, tightly packed. `copy_w`/`copy_h` are clamped to the
    /// texture size; `out` is resized to exactly the copied area.
    ///
    /// Returns the copied (width, height).
    pub fn read_texture(
        &mut self,
        source: &ID3D11Texture2D,
        copy_w: u32,
        copy_h: u32,
        out: &mut Vec<u8>,
    ) -> Result<(u32, u32)> {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        // SAFETY: GetDesc writes the out-struct only.
        unsafe {
            source.GetDesc(&mut desc);
        }
        if desc.Format != DXGI_FORMAT_B8G8R8A8_UNORM {
            bail!("unsupported capture format: {:?}", desc.Format);
        }

        let copy_w = copy_w.min(desc.Width);
        let copy_h = copy_h.min(desc.Height);
        if copy_w == 0 || copy_h == 0 {
            bail!("degenerate copy region {}x{}", copy_w, copy_h);
        }

        self.ensure_staging(desc.Width, desc.Height)?;
        let staging = self.staging.as_ref().unwrap();

        let row_bytes = copy_w as usize * BYTES_PER_PIXEL;
        out.resize(row_bytes * copy_h as usize, 0);

        unsafe {
            // SAFETY: staging matches the source size/format; Map gives
            // read access until Unmap on the same context thread.
            self.context.CopyResource(staging, source);

            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            self.context
                .Map(staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                .context("failed to map staging texture")?;

            let row_pitch = mapped.RowPitch as usize;
            let src = mapped.pData as *const u8;
            for y in 0..copy_h as usize {
                // SAFETY: y * row_pitch + row_bytes stays inside the
                // mapped subresource because copy_w <= desc.Width and
                // copy_h <= desc.Height; out was resized above.
                std::ptr::copy_nonoverlapping(
                    src.add(y * row_pitch),
                    out.as_mut_ptr().add(y * row_bytes),
                    row_bytes,
                );
            }

            self.context.Unmap(staging, 0);
        }

        Ok((copy_w, copy_h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windows::Win32::Graphics::Direct3D11::{D3D11_SUBRESOURCE_DATA, D3D11_USAGE_DEFAULT};

    // Live GPU tests: skip when no device is available.
    fn ctx_or_skip() -> Option<D3D11Context> {
        match create_d3d11_device() {
            Ok(ctx) => Some(ctx),
            Err(_) => {
                println!("SKIPPED: no D3D11 device");
                None
            }
        }
    }

    fn make_texture(ctx: &D3D11Context, width: u32, height: u32, init: &[u8]) -> ID3D11Texture2D {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: 0,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };
        let sub = D3D11_SUBRESOURCE_DATA {
            pSysMem: init.as_ptr() as *const _,
            SysMemPitch: width * 4,
            SysMemSlicePitch: 0,
        };
        unsafe {
            let mut t = None;
            ctx.device
                .CreateTexture2D(&desc, Some(&sub), Some(&mut t))
                .unwrap();
            t.unwrap()
        }
    }

    #[test]
    fn test_readback_strips_row_pitch() {
        let Some(ctx) = ctx_or_skip() else { return };
        let mut reader = TextureReader::new(ctx.device.clone(), ctx.context.clone());

        // 2x2 BGRA: blue, green / red, white.
        let pixels: [[u8; 4]; 4] = [
            [255, 0, 0, 255],
            [0, 255, 0, 255],
            [0, 0, 255, 255],
            [255, 255, 255, 255],
        ];
        let init: Vec<u8> = pixels.iter().flatten().copied().collect();
        let texture = make_texture(&ctx, 2, 2, &init);

        let mut out = Vec::new();
        let (w, h) = reader.read_texture(&texture, 2, 2, &mut out).unwrap();
        assert_eq!((w, h), (2, 2));
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..4], &[255, 0, 0, 255]);
        assert_eq!(&out[12..16], &[255, 255, 255, 255]);
    }

    #[test]
    fn test_readback_clips_to_copy_region() {
        let Some(ctx) = ctx_or_skip() else { return };
        let mut reader = TextureReader::new(ctx.device.clone(), ctx.context.clone());

        let init = vec![0x42u8; 8 * 8 * 4];
        let texture = make_texture(&ctx, 8, 8, &init);

        // Clip to 3x5: the content-size path during window resizes.
        let mut out = Vec::new();
        let (w, h) = reader.read_texture(&texture, 3, 5, &mut out).unwrap();
        assert_eq!((w, h), (3, 5));
        assert_eq!(out.len(), 3 * 5 * 4);
        assert!(out.iter().all(|&b| b == 0x42));
    }
}
